/// Bridges locally attached MIDI hardware into the mesh. Opens every
/// enumerated port once at startup: output ports are published into
/// `NodeState::local_ports` for the router's delivery path, and input ports
/// each get a dedicated polling task that classifies and routes whatever
/// arrives, the same "one task owns one device" shape the reference host
/// daemon's USB reader uses, adapted to this crate's non-blocking
/// `MidiPort::poll_receive` instead of a blocking ALSA read.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshmidi_device::MidiPort;
use meshmidi_protocol::packet::MidiPacket;
use meshmidi_protocol::routing::{DeviceDirection, DeviceKey};
use tracing::{info, warn};

use crate::state::NodeState;

/// How often an input port with nothing pending is re-polled. `poll_receive`
/// never blocks, so this is purely a CPU/latency tradeoff.
const POLL_INTERVAL_MS: u64 = 2;

/// Opens every port `NodeState::local_devices` enumerated at startup. Call
/// once, after `local_devices` is populated and before the mesh starts
/// routing traffic.
pub async fn open_local_ports(state: Arc<NodeState>) {
    let descriptors = state.local_devices.read().expect("local devices poisoned").clone();

    for descriptor in descriptors {
        match meshmidi_device::open(descriptor.device_id) {
            Ok(port) => {
                let port: Arc<dyn MidiPort> = Arc::from(port);
                info!(
                    device_id = port.id(),
                    name = port.name(),
                    direction = ?port.direction(),
                    "opened local MIDI port"
                );
                match port.direction() {
                    DeviceDirection::Output => {
                        state
                            .local_ports
                            .write()
                            .expect("local ports poisoned")
                            .insert(port.id(), port);
                    }
                    DeviceDirection::Input => {
                        tokio::spawn(run_input_poll(Arc::clone(&state), port));
                    }
                }
            }
            Err(e) => {
                warn!(device_id = descriptor.device_id, error = %e, "failed to open local MIDI port");
            }
        }
    }
}

/// Owns one input port for its whole lifetime: polls it, classifies each
/// message that arrives, and hands it to the router exactly like an inbound
/// message from a peer would be. A fresh `MidiPacket` carries no forwarding
/// context — it is the origin of a path, not a relay — so `Router::route`
/// attaches one only if and when it needs to forward the message onward.
async fn run_input_poll(state: Arc<NodeState>, port: Arc<dyn MidiPort>) {
    let device_id = port.id();
    let source = DeviceKey::local(device_id);

    loop {
        match port.poll_receive() {
            Ok(Some(bytes)) => {
                let packet = MidiPacket::new(state.identity.uuid.hash32(), 0, device_id, bytes);
                let local_ports = state.local_ports.read().expect("local ports poisoned").clone();
                let connections: HashMap<_, _> = state
                    .connections_snapshot()
                    .into_iter()
                    .map(|h| (h.remote_uuid, h))
                    .collect();
                state.router.route(source, &packet, &local_ports, &connections, &state.metrics);
            }
            Ok(None) => {
                tokio::select! {
                    biased;
                    _ = state.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
                }
            }
            Err(e) => {
                warn!(device_id, error = %e, "local MIDI input failed, reader exiting");
                return;
            }
        }
    }
}
