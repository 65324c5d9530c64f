/// The 4-message connection handshake: SYN → SYN-ACK → ACK → device-list
/// response, carried over the control surface's HTTP endpoint rather than a
/// raw socket, since every node already runs an axum control server (see
/// `control_api`). Two HTTP round trips: POST Syn gets back SynAck, POST Ack
/// gets back the peer's device list.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshmidi_protocol::config::HandshakeSection;
use meshmidi_protocol::error::HandshakeError;
use meshmidi_protocol::identity::NodeIdentity;
use meshmidi_protocol::routing::DeviceInfo;
use meshmidi_protocol::uuid::NodeUuid;
use meshmidi_protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HandshakeMessage {
    Syn {
        uuid_hex: String,
        name: String,
        protocol_version: u8,
        control_port: u16,
        data_port: u16,
    },
    SynAck {
        uuid_hex: String,
        name: String,
        protocol_version: u8,
        control_port: u16,
        data_port: u16,
    },
    Ack {
        uuid_hex: String,
    },
    DeviceListResponse {
        devices: Vec<DeviceInfo>,
    },
}

pub struct HandshakeOutcome {
    pub remote_uuid: NodeUuid,
    pub remote_name: String,
    pub remote_control_port: u16,
    pub remote_data_port: u16,
    pub remote_devices: Vec<DeviceInfo>,
}

/// Client side: drive the handshake against a newly discovered peer at
/// `peer_control_addr`, retrying the whole exchange up to
/// `retry_attempts` times on timeout or transport error.
/// Drives the handshake against a peer discovery already identified by
/// `expected_uuid`. Every response is checked against that uuid: if the
/// socket at `peer_control_addr` answers as a different node (stale
/// discovery record, address reuse, NAT weirdness) the handshake fails with
/// `WrongPeer` rather than silently wiring up a connection to whoever
/// actually answered (§4.2 "UUID equality with the peer advertised by
/// discovery").
pub async fn initiate(
    local: &NodeIdentity,
    local_control_port: u16,
    local_data_port: u16,
    peer_control_addr: SocketAddr,
    expected_uuid: NodeUuid,
    cfg: &HandshakeSection,
) -> Result<HandshakeOutcome, HandshakeError> {
    let client = reqwest::Client::new();
    let url = format!("http://{}/network/handshake", peer_control_addr);
    let deadline = Duration::from_millis(cfg.inquiry_timeout_ms);

    let mut last_err = HandshakeError::Timeout(cfg.inquiry_timeout_ms);

    for attempt in 0..cfg.retry_attempts.max(1) {
        match try_once(&client, &url, local, local_control_port, local_data_port, expected_uuid, deadline).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                debug!(attempt, peer = %peer_control_addr, error = %e, "handshake attempt failed");
                last_err = e;
                tokio::time::sleep(Duration::from_millis(cfg.retry_delay_ms)).await;
            }
        }
    }
    Err(last_err)
}

async fn try_once(
    client: &reqwest::Client,
    url: &str,
    local: &NodeIdentity,
    local_control_port: u16,
    local_data_port: u16,
    expected_uuid: NodeUuid,
    deadline: Duration,
) -> Result<HandshakeOutcome, HandshakeError> {
    let syn = HandshakeMessage::Syn {
        uuid_hex: local.uuid.to_hex(),
        name: local.name.clone(),
        protocol_version: PROTOCOL_VERSION,
        control_port: local_control_port,
        data_port: local_data_port,
    };

    let resp = tokio::time::timeout(deadline, client.post(url).json(&syn).send())
        .await
        .map_err(|_| HandshakeError::Timeout(deadline.as_millis() as u64))?
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let syn_ack: HandshakeMessage = resp
        .json()
        .await
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let (remote_uuid, remote_name, remote_control_port, remote_data_port) = match syn_ack {
        HandshakeMessage::SynAck {
            uuid_hex,
            name,
            protocol_version,
            control_port,
            data_port,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(HandshakeError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    got: protocol_version,
                });
            }
            let uuid = NodeUuid::from_hex(&uuid_hex)
                .ok_or_else(|| HandshakeError::Malformed("bad uuid in SynAck".to_string()))?;
            if uuid != expected_uuid {
                return Err(HandshakeError::WrongPeer {
                    expected: expected_uuid.to_hex(),
                    got: uuid.to_hex(),
                });
            }
            (uuid, name, control_port, data_port)
        }
        _ => return Err(HandshakeError::Malformed("expected SynAck".to_string())),
    };

    let ack = HandshakeMessage::Ack {
        uuid_hex: local.uuid.to_hex(),
    };
    let resp = tokio::time::timeout(deadline, client.post(url).json(&ack).send())
        .await
        .map_err(|_| HandshakeError::Timeout(deadline.as_millis() as u64))?
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let device_list: HandshakeMessage = resp
        .json()
        .await
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let devices = match device_list {
        HandshakeMessage::DeviceListResponse { devices } => devices,
        _ => return Err(HandshakeError::Malformed("expected DeviceListResponse".to_string())),
    };

    Ok(HandshakeOutcome {
        remote_uuid,
        remote_name,
        remote_control_port,
        remote_data_port,
        remote_devices: devices,
    })
}

/// Server side handler body, invoked by the control API route for
/// `POST /network/handshake`. Returns the next message in the exchange, or
/// `None` when `msg` doesn't advance the state machine (caller responds 400).
///
/// The `Syn` branch is also where an inbound connection is actually born:
/// unlike the initiator, which spawns its worker in `mesh::connect_to_peer`
/// once it has an outcome in hand, the accepting side only learns who's
/// calling and which ports to talk to when `Syn` arrives, so it spawns here.
pub fn respond(
    state: &Arc<crate::state::NodeState>,
    peer_addr: SocketAddr,
    msg: HandshakeMessage,
) -> Option<HandshakeMessage> {
    match msg {
        HandshakeMessage::Syn {
            uuid_hex,
            name,
            protocol_version,
            control_port,
            data_port,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                warn!(got = protocol_version, "rejecting handshake with mismatched protocol version");
                return None;
            }
            let remote_uuid = match NodeUuid::from_hex(&uuid_hex) {
                Some(uuid) => uuid,
                None => {
                    warn!("rejecting handshake with malformed uuid");
                    return None;
                }
            };

            if state.connection(remote_uuid).is_none() {
                if let Err(e) = state.registry.register(remote_uuid) {
                    warn!(peer = %remote_uuid, error = %e, "refusing inbound connection, hash collision");
                    return None;
                }
                let handle = crate::connection::worker::spawn(
                    state.identity.uuid,
                    remote_uuid,
                    name.clone(),
                    SocketAddr::new(peer_addr.ip(), control_port),
                    SocketAddr::new(peer_addr.ip(), data_port),
                    Arc::clone(&state.data_socket),
                    state.inbound_tx.clone(),
                    state.config.heartbeat.timeout_ms,
                    Arc::clone(&state.metrics),
                    state.shutdown.clone(),
                    Vec::new(),
                );
                info!(peer = %remote_uuid, %name, "accepted inbound connection");
                state.insert_connection(Arc::new(handle));
            }

            Some(HandshakeMessage::SynAck {
                uuid_hex: state.identity.uuid.to_hex(),
                name: state.identity.name.clone(),
                protocol_version: PROTOCOL_VERSION,
                control_port: state.config.network.control_port,
                data_port: state.config.network.data_port,
            })
        }
        HandshakeMessage::Ack { uuid_hex } => {
            debug!(peer = %uuid_hex, "handshake ack received");
            let devices = state.local_devices.read().expect("local devices poisoned").clone();
            Some(HandshakeMessage::DeviceListResponse { devices })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_ack_serializes_with_kind_tag() {
        let msg = HandshakeMessage::Syn {
            uuid_hex: "a".repeat(32),
            name: "node-a".to_string(),
            protocol_version: PROTOCOL_VERSION,
            control_port: 7070,
            data_port: 5104,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"Syn\""));
    }

    async fn test_state(label: &str) -> Arc<crate::state::NodeState> {
        let dir = std::env::temp_dir().join(format!(
            "meshmidi-handshake-test-{}-{}-{}",
            label,
            std::process::id(),
            label.len()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let identity = NodeIdentity::load_or_create(&dir, "test-node").unwrap();
        let data_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::channel(8);
        Arc::new(crate::state::NodeState::new(
            meshmidi_protocol::config::NodeConfig::default(),
            identity,
            data_socket,
            inbound_tx,
        ))
    }

    #[tokio::test]
    async fn syn_spawns_and_registers_inbound_connection() {
        let state = test_state("syn-registers").await;
        let remote_uuid = NodeUuid::generate();
        let peer_addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let reply = respond(
            &state,
            peer_addr,
            HandshakeMessage::Syn {
                uuid_hex: remote_uuid.to_hex(),
                name: "remote-node".to_string(),
                protocol_version: PROTOCOL_VERSION,
                control_port: 7070,
                data_port: 5104,
            },
        );

        assert!(matches!(reply, Some(HandshakeMessage::SynAck { .. })));
        let conn = state.connection(remote_uuid).expect("inbound connection should be registered");
        assert_eq!(conn.remote_name, "remote-node");
    }

    #[tokio::test]
    async fn initiate_rejects_peer_answering_as_wrong_uuid() {
        let local_identity = NodeIdentity::load_or_create(
            &std::env::temp_dir().join(format!("meshmidi-handshake-local-{}", std::process::id())),
            "local-node",
        )
        .unwrap();
        let remote_state = test_state("wrong-peer-remote").await;
        let actual_remote_uuid = remote_state.identity.uuid;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = crate::control_api::build_router(Arc::clone(&remote_state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await;
        });

        // Expect a different uuid than the one the server will actually answer with.
        let bogus_expected = NodeUuid::generate();
        assert_ne!(bogus_expected, actual_remote_uuid);

        let cfg = meshmidi_protocol::config::HandshakeSection {
            inquiry_timeout_ms: 1_000,
            retry_attempts: 1,
            retry_delay_ms: 10,
        };

        let result = initiate(&local_identity, 7070, 5104, addr, bogus_expected, &cfg).await;
        assert!(matches!(result, Err(HandshakeError::WrongPeer { .. })));
    }

    #[tokio::test]
    async fn syn_rejects_mismatched_protocol_version() {
        let state = test_state("syn-version-mismatch").await;
        let remote_uuid = NodeUuid::generate();
        let peer_addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let reply = respond(
            &state,
            peer_addr,
            HandshakeMessage::Syn {
                uuid_hex: remote_uuid.to_hex(),
                name: "remote-node".to_string(),
                protocol_version: PROTOCOL_VERSION + 1,
                control_port: 7070,
                data_port: 5104,
            },
        );

        assert!(reply.is_none());
        assert!(state.connection(remote_uuid).is_none());
    }
}
