/// UDP multicast discovery fallback for networks where mDNS doesn't reach —
/// grounded on the reference host's broadcast discovery responder, adapted
/// from a request/response pattern to periodic self-announcement plus
/// peer-timeout tracking, since every node here is both advertiser and
/// listener.
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use meshmidi_protocol::error::DiscoveryError;
use meshmidi_protocol::uuid::NodeUuid;

use crate::discovery::{DiscoveredPeer, DiscoveryEvent};
use crate::state::NodeState;

/// On-wire shape of a fallback-discovery announcement: a plain JSON object,
/// one per multicast datagram.
#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    uuid_hex: String,
    name: String,
    control_port: u16,
    data_port: u16,
}

pub async fn run(state: Arc<NodeState>, events: mpsc::Sender<DiscoveryEvent>) -> anyhow::Result<()> {
    let group: Ipv4Addr = state
        .config
        .discovery
        .multicast_group
        .parse()
        .unwrap_or(Ipv4Addr::new(239, 255, 42, 99));
    let port = state.config.network.discovery_port;

    let socket = {
        let s = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        s.set_reuse_address(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        s.bind(&bind_addr.into())?;
        s.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        s.set_nonblocking(true)?;
        UdpSocket::from_std(s.into())?
    };
    let socket = Arc::new(socket);
    let dest = SocketAddr::V4(SocketAddrV4::new(group, port));

    info!(%group, port, "multicast discovery listening");

    let announce_interval = Duration::from_secs(state.config.discovery.multicast_announce_interval_s.max(1));
    let peer_timeout = Duration::from_secs(state.config.discovery.multicast_peer_timeout_s.max(1));

    let announce_socket = Arc::clone(&socket);
    let announce_state = Arc::clone(&state);
    let announce_shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(announce_interval);
        loop {
            tokio::select! {
                biased;
                _ = announce_shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let frame = build_announcement(&announce_state);
            if let Err(e) = announce_socket.send_to(&frame, dest).await {
                warn!(error = %e, "multicast announce send failed");
            }
        }
    });

    let mut buf = [0u8; 256];
    let mut last_seen: HashMap<NodeUuid, Instant> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return Ok(()),
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, src)) => {
                        if let Some(peer) = parse_announcement(&buf[..len], src) {
                            if peer.uuid != state.identity.uuid {
                                last_seen.insert(peer.uuid, Instant::now());
                                let _ = events.send(DiscoveryEvent::Discovered(peer)).await;
                            }
                        } else {
                            let err = DiscoveryError::MalformedRecord(src.to_string());
                            debug!(error = %err, "ignoring multicast announcement");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "multicast recv error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = tokio::time::sleep(peer_timeout) => {
                let now = Instant::now();
                let expired: Vec<NodeUuid> = last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) > peer_timeout)
                    .map(|(uuid, _)| *uuid)
                    .collect();
                for uuid in expired {
                    last_seen.remove(&uuid);
                    debug!(%uuid, "multicast peer timed out");
                    let _ = events.send(DiscoveryEvent::Removed(uuid)).await;
                }
            }
        }
    }
}

fn build_announcement(state: &NodeState) -> Vec<u8> {
    let announcement = Announcement {
        uuid_hex: state.identity.uuid.to_hex(),
        name: state.identity.name.clone(),
        control_port: state.config.network.control_port,
        data_port: state.config.network.data_port,
    };
    serde_json::to_vec(&announcement).expect("Announcement always serializes")
}

fn parse_announcement(data: &[u8], src: SocketAddr) -> Option<DiscoveredPeer> {
    let announcement: Announcement = serde_json::from_slice(data).ok()?;
    let uuid = NodeUuid::from_hex(&announcement.uuid_hex)?;

    Some(DiscoveredPeer {
        uuid,
        name: announcement.name,
        control_addr: SocketAddr::new(src.ip(), announcement.control_port),
        data_addr: SocketAddr::new(src.ip(), announcement.data_port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_roundtrips_through_json() {
        let uuid = NodeUuid::generate();
        let announcement = Announcement {
            uuid_hex: uuid.to_hex(),
            name: "node-a".to_string(),
            control_port: 7070,
            data_port: 5104,
        };
        let buf = serde_json::to_vec(&announcement).unwrap();

        let src: SocketAddr = "192.168.1.5:9999".parse().unwrap();
        let peer = parse_announcement(&buf, src).unwrap();
        assert_eq!(peer.uuid, uuid);
        assert_eq!(peer.name, "node-a");
        assert_eq!(peer.control_addr.port(), 7070);
        assert_eq!(peer.data_addr.ip(), src.ip());
    }

    #[test]
    fn rejects_malformed_json() {
        let src: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(parse_announcement(b"not json", src).is_none());
    }

    #[test]
    fn rejects_unparseable_uuid() {
        let src: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let buf = br#"{"uuid_hex":"nope","name":"n","control_port":1,"data_port":2}"#;
        assert!(parse_announcement(buf, src).is_none());
    }
}
