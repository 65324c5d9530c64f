/// Mesh-wide plumbing: the single shared UDP data socket's receive loop
/// (demuxing inbound datagrams to the right connection worker), the
/// discovery-to-handshake-to-connection pipeline, and the inbound-event
/// dispatcher that feeds the router.
use std::sync::Arc;

use meshmidi_protocol::packet::HeartbeatPacket;
use meshmidi_protocol::routing::DeviceKey;
use meshmidi_protocol::transport_frame;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connection::{worker, InboundEvent};
use crate::discovery::DiscoveryEvent;
use crate::state::NodeState;

/// Reads every inbound datagram on the shared data socket and routes it to
/// the connection it came from, based on source address. Heartbeat packets
/// are handled inline (they only touch the lock-free heartbeat atomic);
/// everything else is handed to the owning connection's command channel.
pub async fn run_data_recv(state: Arc<NodeState>) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, src) = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return,
            result = state.data_socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "data socket recv error");
                    continue;
                }
            },
        };
        let data = &buf[..len];

        if data.len() >= 2 && u16::from_be_bytes([data[0], data[1]]) == meshmidi_protocol::packet::MAGIC_HEARTBEAT {
            if HeartbeatPacket::deserialize(data).is_some() {
                if let Some(handle) = state
                    .connections_snapshot()
                    .into_iter()
                    .find(|h| h.data_addr == src)
                {
                    handle.note_heartbeat_received();
                }
            }
            continue;
        }

        let is_fragment_or_ack = data.len() >= 2
            && (data[0..2] == transport_frame::MAGIC_FRAGMENT || data[0..2] == transport_frame::MAGIC_ACK);
        let is_midi = data.len() >= 2 && u16::from_be_bytes([data[0], data[1]]) == meshmidi_protocol::packet::MAGIC_MIDI;

        if !is_fragment_or_ack && !is_midi {
            continue;
        }

        let handle = state
            .connections_snapshot()
            .into_iter()
            .find(|h| h.data_addr == src);

        let handle = match handle {
            Some(handle) => handle,
            None => {
                warn!(%src, "datagram from unknown peer address, dropping");
                continue;
            }
        };

        // A full `MidiPacket` carries its sender's wire hash in the header;
        // resolve it through the uuid registry and require it to agree with
        // the peer this socket address was matched to. A hash that doesn't
        // resolve, or resolves to someone else, is ambiguous and dropped
        // rather than attributed to the wrong connection.
        if is_midi && data.len() >= meshmidi_protocol::packet::HEADER_SIZE {
            let src_hash = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            match state.registry.lookup(src_hash) {
                Some(uuid) if uuid == handle.remote_uuid => {}
                _ => {
                    warn!(%src, hash = format!("{:#010x}", src_hash), "packet hash does not resolve to the matched peer, dropping");
                    continue;
                }
            }
        }

        handle.inbound_datagram(data.to_vec()).await;
    }
}

/// Consumes `InboundEvent`s produced by connection workers: routes decoded
/// MIDI, records freshly announced remote devices, and tears down failed
/// connections.
pub async fn run_inbound_dispatch(state: Arc<NodeState>, mut inbound_rx: mpsc::Receiver<InboundEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return,
            event = inbound_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            InboundEvent::Midi { from, packet } => {
                let source = DeviceKey::remote(from, packet.device_id);
                let local_ports = state.local_ports.read().expect("local ports poisoned").clone();
                let connections: std::collections::HashMap<_, _> = state
                    .connections_snapshot()
                    .into_iter()
                    .map(|h| (h.remote_uuid, h))
                    .collect();
                state.router.route(source, &packet, &local_ports, &connections, &state.metrics);
            }
            InboundEvent::RemoteDevices { from, devices } => {
                info!(peer = %from, count = devices.len(), "received remote device list");
            }
            InboundEvent::PeerFailed { peer } => {
                warn!(peer = %peer, "connection failed, removing from pool");
                state.remove_connection(peer);
            }
        }
    }
}

/// Consumes discovery events: initiates a handshake with newly discovered
/// peers (when auto-connect is enabled and no connection already exists),
/// and tears down connections for peers discovery reports as gone.
pub async fn run_discovery_dispatch(state: Arc<NodeState>, mut discovery_rx: mpsc::Receiver<DiscoveryEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return,
            event = discovery_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            DiscoveryEvent::Discovered(peer) => {
                if !state.config.discovery.auto_connect {
                    continue;
                }
                let filter = &state.config.discovery.device_name_filter;
                if !filter.is_empty() && !peer.name.contains(filter.as_str()) {
                    continue;
                }
                if state.connection(peer.uuid).is_some() {
                    continue;
                }
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    connect_to_peer(state, peer).await;
                });
            }
            DiscoveryEvent::Removed(uuid) => {
                state.remove_connection(uuid);
            }
        }
    }
}

async fn connect_to_peer(state: Arc<NodeState>, peer: crate::discovery::DiscoveredPeer) {
    let outcome = crate::handshake::initiate(
        &state.identity,
        state.config.network.control_port,
        state.config.network.data_port,
        peer.control_addr,
        peer.uuid,
        &state.config.handshake,
    )
    .await;

    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => {
            crate::metrics::NodeMetrics::incr(&state.metrics.handshakes_failed);
            warn!(peer = %peer.uuid, error = %e, "handshake failed");
            return;
        }
    };

    if let Err(e) = state.registry.register(outcome.remote_uuid) {
        warn!(peer = %outcome.remote_uuid, error = %e, "refusing connection, hash collision");
        return;
    }

    let handle = worker::spawn(
        state.identity.uuid,
        outcome.remote_uuid,
        outcome.remote_name.clone(),
        peer.control_addr,
        std::net::SocketAddr::new(peer.control_addr.ip(), outcome.remote_data_port),
        Arc::clone(&state.data_socket),
        state.inbound_tx.clone(),
        state.config.heartbeat.timeout_ms,
        Arc::clone(&state.metrics),
        state.shutdown.clone(),
        outcome.remote_devices,
    );

    info!(peer = %outcome.remote_uuid, name = %outcome.remote_name, "connected to peer");
    state.insert_connection(Arc::new(handle));

    let local_devices = state.local_devices.read().expect("local devices poisoned").clone();
    if let Some(conn) = state.connection(outcome.remote_uuid) {
        let _ = conn.announce_devices(local_devices).await;
    }
    crate::metrics::NodeMetrics::incr(&state.metrics.handshakes_succeeded);
}
