/// Periodic heartbeat: sends a small `HeartbeatPacket` to every connected
/// peer and posts `CheckHeartbeat` to every connection worker so each one
/// re-evaluates its own received-heartbeat age against the configured
/// timeout — the liveness half of the connection state machine.
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meshmidi_protocol::packet::HeartbeatPacket;
use tracing::warn;

use crate::state::NodeState;

pub async fn run(state: Arc<NodeState>) {
    let interval = Duration::from_millis(state.config.heartbeat.interval_ms.max(50));
    let mut ticker = tokio::time::interval(interval);
    let sequence = AtomicU16::new(0);
    let local_hash = state.identity.uuid.hash32();

    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let seq = sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp_us = now_micros();
        let packet = HeartbeatPacket {
            node_hash: local_hash,
            sequence: seq,
            timestamp_us,
        };
        let mut buf = [0u8; HeartbeatPacket::SIZE];
        packet.serialize(&mut buf);

        for handle in state.connections_snapshot() {
            if let Err(e) = state.data_socket.send_to(&buf, handle.data_addr).await {
                warn!(peer = %handle.remote_uuid, error = %e, "heartbeat send failed");
            }
            handle.check_heartbeat().await;
        }
    }
}

fn now_micros() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or(0)
}
