/// The SEDA event loop itself: one task per connection, owning all of that
/// connection's mutable state (pending acks, reassembly buffer, last-known
/// remote device list). Every other task reaches this state only through
/// `Command`/`Query` messages or the lock-free atomics in `ConnectionHandle`.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshmidi_protocol::error::{StateError, TransportError};
use meshmidi_protocol::packet::MidiPacket;
use meshmidi_protocol::ringbuf::ring_buffer;
use meshmidi_protocol::routing::DeviceInfo;
use meshmidi_protocol::transport_frame::{self, Reassembler};
use meshmidi_protocol::uuid::NodeUuid;
use meshmidi_protocol::{FRAGMENT_MAX_RETRIES, FRAGMENT_RETRY_INTERVAL_MS, RING_BUFFER_CAPACITY};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Command, ConnectionHandle, ConnectionState, InboundEvent, Query};
use crate::metrics::NodeMetrics;

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    local_uuid: NodeUuid,
    remote_uuid: NodeUuid,
    remote_name: String,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    data_socket: Arc<UdpSocket>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    heartbeat_timeout_ms: u64,
    metrics: Arc<NodeMetrics>,
    shutdown: CancellationToken,
    initial_remote_devices: Vec<DeviceInfo>,
) -> ConnectionHandle {
    let (realtime_tx, realtime_rx) = ring_buffer(RING_BUFFER_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel(128);
    let (query_tx, query_rx) = mpsc::channel(32);
    let state = Arc::new(AtomicU8::new(ConnectionState::Connecting.to_u8()));
    let last_heartbeat_recv_ms = Arc::new(AtomicU64::new(0));
    let last_error = Arc::new(Mutex::new(None));

    let worker = Worker {
        local_uuid,
        remote_uuid,
        data_addr,
        data_socket,
        inbound_tx,
        heartbeat_timeout_ms,
        metrics,
        state: Arc::clone(&state),
        last_heartbeat_recv_ms: Arc::clone(&last_heartbeat_recv_ms),
        last_error: Arc::clone(&last_error),
        remote_devices: initial_remote_devices,
        reassembler: Reassembler::new(),
        pending_acks: HashMap::new(),
        next_sequence: 0,
        next_fragment_group: 0,
        shutdown,
    };

    let task = tokio::spawn(worker.run(cmd_rx, query_rx, realtime_rx));

    ConnectionHandle::new(
        remote_uuid,
        remote_name,
        control_addr,
        data_addr,
        realtime_tx,
        cmd_tx,
        query_tx,
        state,
        last_heartbeat_recv_ms,
        last_error,
        task,
    )
}

struct Worker {
    local_uuid: NodeUuid,
    remote_uuid: NodeUuid,
    data_addr: SocketAddr,
    data_socket: Arc<UdpSocket>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    heartbeat_timeout_ms: u64,
    metrics: Arc<NodeMetrics>,
    state: Arc<AtomicU8>,
    last_heartbeat_recv_ms: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
    remote_devices: Vec<DeviceInfo>,
    reassembler: Reassembler,
    pending_acks: HashMap<u32, oneshot::Sender<()>>,
    next_sequence: u16,
    next_fragment_group: u32,
    shutdown: CancellationToken,
}

impl Worker {
    fn set_state(&self, s: ConnectionState) {
        self.state.store(s.to_u8(), Ordering::Release);
    }

    /// Records the error that killed this connection and transitions it to
    /// `Failed` — the control surface's `/status` reads this back per peer.
    fn fail(&self, error: String) {
        *self.last_error.lock().expect("last_error poisoned") = Some(error);
        self.set_state(ConnectionState::Failed);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Send commands are rejected synchronously when the connection isn't
    /// `Connected` (§4.1) rather than attempted on a socket that's about to
    /// be torn down. Returns `false` when the caller should skip the send.
    fn reject_unless_connected(&self, op: &str) -> bool {
        let state = self.state();
        if state == ConnectionState::Connected {
            return true;
        }
        let err = StateError::InvalidStateForOperation {
            op: op.to_string(),
            state: format!("{:?}", state),
        };
        warn!(peer = %self.remote_uuid, error = %err, "rejecting send");
        false
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut query_rx: mpsc::Receiver<Query>,
        realtime_rx: meshmidi_protocol::ringbuf::RingConsumer,
    ) {
        self.set_state(ConnectionState::Connected);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(cmd) = cmd_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                Some(query) = query_rx.recv() => {
                    self.handle_query(query);
                }

                (midi, device_id, timestamp_us) = realtime_rx.pop() => {
                    self.send_realtime(device_id, timestamp_us, midi).await;
                }

                else => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        query_rx.close();
        while let Ok(query) = query_rx.try_recv() {
            self.handle_query(query);
        }
        let _ = self
            .inbound_tx
            .send(InboundEvent::PeerFailed { peer: self.remote_uuid })
            .await;
    }

    async fn send_realtime(&mut self, device_id: u16, timestamp_us: u32, midi: Vec<u8>) {
        let mut packet = MidiPacket::new(
            self.local_uuid.hash32(),
            self.remote_uuid.hash32(),
            device_id,
            midi,
        );
        packet.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        packet.timestamp_us = timestamp_us;

        let mut buf = Vec::new();
        packet.serialize(&mut buf);
        if let Err(e) = self.data_socket.send_to(&buf, self.data_addr).await {
            NodeMetrics::incr(&self.metrics.udp_send_failures);
            let err = TransportError::SendFailed(e.to_string());
            warn!(peer = %self.remote_uuid, error = %err, "real-time send failed");
        }
    }

    /// Sends an already-assembled packet as-is, preserving whatever
    /// `ForwardingContext` the router attached. Used for relayed real-time
    /// traffic, where the context must survive the hop.
    async fn send_realtime_packet(&self, packet: MidiPacket) {
        let mut buf = Vec::new();
        packet.serialize(&mut buf);
        if let Err(e) = self.data_socket.send_to(&buf, self.data_addr).await {
            NodeMetrics::incr(&self.metrics.udp_send_failures);
            let err = TransportError::SendFailed(e.to_string());
            warn!(peer = %self.remote_uuid, error = %err, "relayed real-time send failed");
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendReliable(packet) => {
                if !self.reject_unless_connected("SendReliable") {
                    return true;
                }
                self.send_reliable(packet).await;
                true
            }
            Command::SendRealtime(packet) => {
                if !self.reject_unless_connected("SendRealtime") {
                    return true;
                }
                self.send_realtime_packet(packet).await;
                true
            }
            Command::AnnounceDevices(devices) => {
                if let Ok(bytes) = serde_json::to_vec(&devices) {
                    self.send_reliable_bytes(bytes, true).await;
                }
                true
            }
            Command::InboundDatagram(data) => {
                self.handle_inbound_datagram(data).await;
                true
            }
            Command::CheckHeartbeat => {
                let last = self.last_heartbeat_recv_ms.load(Ordering::Relaxed);
                if last != 0 {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    if now.saturating_sub(last) > self.heartbeat_timeout_ms {
                        let msg = format!(
                            "heartbeat timed out after {}ms",
                            now.saturating_sub(last)
                        );
                        warn!(peer = %self.remote_uuid, error = %msg, "marking connection failed");
                        self.fail(msg);
                        return false;
                    }
                }
                true
            }
            Command::Disconnect => {
                debug!(peer = %self.remote_uuid, "connection worker disconnecting");
                false
            }
        }
    }

    fn handle_query(&self, query: Query) {
        match query {
            Query::State(tx) => {
                let _ = tx.send(self.state());
            }
            Query::RemoteDevices(tx) => {
                let _ = tx.send(self.remote_devices.clone());
            }
        }
    }

    async fn handle_inbound_datagram(&mut self, data: Vec<u8>) {
        if data.len() >= 2 && data[0..2] == meshmidi_protocol::transport_frame::MAGIC_ACK {
            if let Some(seq) = transport_frame::decode_ack(&data) {
                if let Some(tx) = self.pending_acks.remove(&seq) {
                    let _ = tx.send(());
                }
            }
            return;
        }

        if data.len() >= 2 && data[0..2] == meshmidi_protocol::transport_frame::MAGIC_FRAGMENT {
            if let Some(fragment) = transport_frame::Fragment::decode(&data) {
                let sequence = fragment.sequence;
                let mut ack_buf = [0u8; transport_frame::ACK_FRAME_SIZE];
                transport_frame::encode_ack(&mut ack_buf, sequence);
                let _ = self.data_socket.send_to(&ack_buf, self.data_addr).await;

                match self.reassembler.feed(fragment) {
                    transport_frame::FeedOutcome::Complete(payload) => {
                        self.reassembler = Reassembler::new();
                        self.deliver_reassembled(payload).await;
                    }
                    transport_frame::FeedOutcome::CapExceeded => {
                        let err = TransportError::ReassemblyCapExceeded(sequence);
                        warn!(peer = %self.remote_uuid, error = %err, "abandoning payload");
                        NodeMetrics::incr(&self.metrics.reassembly_cap_exceeded);
                        self.reassembler = Reassembler::new();
                    }
                    transport_frame::FeedOutcome::Pending => {}
                }
            }
            return;
        }

        match MidiPacket::deserialize(&data) {
            Ok(packet) => {
                let _ = self
                    .inbound_tx
                    .send(InboundEvent::Midi {
                        from: self.remote_uuid,
                        packet,
                    })
                    .await;
            }
            Err(e) => {
                warn!(peer = %self.remote_uuid, error = %e, "dropped malformed datagram");
            }
        }
    }

    async fn deliver_reassembled(&mut self, payload: Vec<u8>) {
        if let Ok(packet) = MidiPacket::deserialize(&payload) {
            let _ = self
                .inbound_tx
                .send(InboundEvent::Midi {
                    from: self.remote_uuid,
                    packet,
                })
                .await;
            return;
        }
        if let Ok(devices) = serde_json::from_slice::<Vec<DeviceInfo>>(&payload) {
            self.remote_devices = devices.clone();
            let _ = self
                .inbound_tx
                .send(InboundEvent::RemoteDevices {
                    from: self.remote_uuid,
                    devices,
                })
                .await;
        }
    }

    async fn send_reliable(&mut self, packet: MidiPacket) {
        let mut bytes = Vec::new();
        packet.serialize(&mut bytes);
        self.send_reliable_bytes(bytes, false).await;
    }

    /// Segment `bytes` and drive each fragment through send/ack/retry,
    /// sequentially, honoring `FRAGMENT_MAX_RETRIES` per fragment.
    async fn send_reliable_bytes(&mut self, bytes: Vec<u8>, _is_device_announce: bool) {
        let group = self.next_fragment_group;
        self.next_fragment_group = self.next_fragment_group.wrapping_add(1_000_000);
        let fragments = transport_frame::segment(&bytes, group);

        for fragment in fragments {
            let sequence = fragment.sequence;
            let mut buf = Vec::new();
            fragment.encode(&mut buf);

            let mut attempt = 0;
            loop {
                let (ack_tx, ack_rx) = oneshot::channel();
                self.pending_acks.insert(sequence, ack_tx);

                if let Err(e) = self.data_socket.send_to(&buf, self.data_addr).await {
                    warn!(peer = %self.remote_uuid, error = %e, "reliable fragment send failed");
                }

                match timeout(Duration::from_millis(FRAGMENT_RETRY_INTERVAL_MS), ack_rx).await {
                    Ok(Ok(())) => break,
                    _ => {
                        self.pending_acks.remove(&sequence);
                        attempt += 1;
                        if attempt >= FRAGMENT_MAX_RETRIES {
                            let err = TransportError::AckTimeout { sequence, retries: attempt };
                            warn!(peer = %self.remote_uuid, error = %err, "giving up on this payload");
                            NodeMetrics::incr(&self.metrics.delivery_failed);
                            return;
                        }
                    }
                }
            }
        }
    }
}
