/// mDNS advertisement and browsing, grounded on the reference host's mDNS
/// task: register this node's service record, then watch for peers
/// advertising the same service type and turn their TXT records into
/// `DiscoveryEvent`s.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use meshmidi_protocol::error::DiscoveryError;
use meshmidi_protocol::uuid::NodeUuid;
use meshmidi_protocol::MDNS_SERVICE_TYPE;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveredPeer, DiscoveryEvent};
use crate::state::NodeState;

pub async fn run(state: Arc<NodeState>, events: mpsc::Sender<DiscoveryEvent>) -> anyhow::Result<()> {
    let mdns = ServiceDaemon::new()?;

    let instance_name = format!("meshmidi-{}", state.identity.uuid.to_hex());
    let device_count = state.local_devices.read().expect("local devices poisoned").len();
    let mut properties = HashMap::new();
    properties.insert("uuid".to_string(), state.identity.uuid.to_hex());
    properties.insert("name".to_string(), state.identity.name.clone());
    properties.insert("control_port".to_string(), state.config.network.control_port.to_string());
    properties.insert("data_port".to_string(), state.config.network.data_port.to_string());
    properties.insert("hostname".to_string(), state.config.node.name.clone());
    properties.insert("version".to_string(), meshmidi_protocol::PROTOCOL_VERSION.to_string());
    properties.insert("devices".to_string(), device_count.to_string());

    let service_info = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        &instance_name,
        &format!("{}.local.", state.config.node.name),
        "",
        state.config.network.control_port,
        properties,
    )?;
    mdns.register(service_info)?;
    info!(instance = %instance_name, "mDNS service registered");

    let receiver = mdns.browse(MDNS_SERVICE_TYPE)?;
    loop {
        let event = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => break,
            event = receiver.recv_async() => event,
        };
        match event {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(peer) = peer_from_service_info(&info) {
                    if peer.uuid != state.identity.uuid {
                        let _ = events.send(DiscoveryEvent::Discovered(peer)).await;
                    }
                } else {
                    let err = DiscoveryError::MalformedRecord(info.get_fullname().to_string());
                    debug!(error = %err, "ignoring mDNS record");
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                if let Some(uuid) = uuid_from_fullname(&fullname) {
                    let _ = events.send(DiscoveryEvent::Removed(uuid)).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mDNS browse channel closed");
                break;
            }
        }
    }

    mdns.shutdown()?;
    Ok(())
}

/// Recovers the uuid from a `ServiceRemoved` fullname, whose instance
/// component is the same `meshmidi-<hex>` label this node registers under.
fn uuid_from_fullname(fullname: &str) -> Option<NodeUuid> {
    let instance = fullname.split('.').next().unwrap_or("");
    let hex = instance.strip_prefix("meshmidi-").unwrap_or(instance);
    NodeUuid::from_hex(hex)
}

fn peer_from_service_info(info: &ServiceInfo) -> Option<DiscoveredPeer> {
    let props = info.get_properties();
    let uuid_hex = props.get_property_val_str("uuid")?;
    let uuid = NodeUuid::from_hex(uuid_hex)?;
    let name = props
        .get_property_val_str("name")
        .unwrap_or("unnamed")
        .to_string();
    let control_port: u16 = props.get_property_val_str("control_port")?.parse().ok()?;
    let data_port: u16 = props.get_property_val_str("data_port")?.parse().ok()?;
    let addr = info.get_addresses().iter().next()?;

    Some(DiscoveredPeer {
        uuid,
        name,
        control_addr: SocketAddr::new(*addr, control_port),
        data_addr: SocketAddr::new(*addr, data_port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_fullname_strips_prefix_and_service_suffix() {
        let uuid = NodeUuid::generate();
        let fullname = format!("meshmidi-{}.{}", uuid.to_hex(), MDNS_SERVICE_TYPE);
        assert_eq!(uuid_from_fullname(&fullname), Some(uuid));
    }

    #[test]
    fn uuid_from_fullname_rejects_garbage() {
        assert_eq!(uuid_from_fullname("not-a-uuid._midi-network._tcp.local."), None);
    }
}
