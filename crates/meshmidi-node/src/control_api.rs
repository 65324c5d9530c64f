/// Minimal HTTP control surface: handshake endpoint plus read/write status,
/// device, and routing-rule endpoints for the CLI. Built the same way the
/// reference admin panel assembles its router — one `Router::new()` with a
/// route per concern, `with_state` at the end — but scoped down to what the
/// mesh core needs rather than a full dashboard API.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use meshmidi_protocol::routing::RoutingRule;
use serde_json::{json, Value};

use crate::handshake::{self, HandshakeMessage};
use crate::state::NodeState;

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/network/handshake", post(handshake_endpoint))
        .route("/status", get(get_status))
        .route("/devices", get(get_devices))
        .route("/rules", get(get_rules).post(add_rule))
        .route("/rules/:id", delete(remove_rule))
        .with_state(state)
}

async fn handshake_endpoint(
    State(state): State<Arc<NodeState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Json(msg): Json<HandshakeMessage>,
) -> Result<Json<HandshakeMessage>, StatusCode> {
    match handshake::respond(&state, peer_addr, msg) {
        Some(reply) => Ok(Json(reply)),
        None => Err(StatusCode::BAD_REQUEST),
    }
}

async fn get_status(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let snapshot = state.metrics.snapshot();
    let connections: Vec<Value> = state
        .connections_snapshot()
        .iter()
        .map(|h| {
            json!({
                "uuid": h.remote_uuid.to_hex(),
                "name": h.remote_name,
                "state": format!("{:?}", h.state()),
                "heartbeat_age_ms": h.heartbeat_age_ms(),
                "last_error": h.last_error(),
            })
        })
        .collect();

    Json(json!({
        "node": {
            "uuid": state.identity.uuid.to_hex(),
            "name": state.identity.name,
        },
        "connections": connections,
        "metrics": snapshot,
    }))
}

async fn get_devices(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let local = state.local_devices.read().expect("local devices poisoned").clone();

    let mut remote = Vec::new();
    for conn in state.connections_snapshot() {
        if let Ok(devices) = conn.remote_devices().await {
            remote.push(json!({
                "node_uuid": conn.remote_uuid.to_hex(),
                "node_name": conn.remote_name,
                "devices": devices,
            }));
        }
    }

    Json(json!({ "local": local, "remote": remote }))
}

async fn get_rules(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({ "rules": state.router.table.snapshot() }))
}

async fn add_rule(
    State(state): State<Arc<NodeState>>,
    Json(rule): Json<RoutingRule>,
) -> StatusCode {
    state.router.table.add(rule);
    StatusCode::CREATED
}

async fn remove_rule(State(state): State<Arc<NodeState>>, Path(id): Path<u32>) -> StatusCode {
    if state.router.table.remove(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use meshmidi_protocol::config::NodeConfig;
    use meshmidi_protocol::identity::NodeIdentity;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn test_state(label: &str) -> Arc<NodeState> {
        let dir = std::env::temp_dir().join(format!(
            "meshmidi-control-api-test-{}-{}-{}",
            label,
            std::process::id(),
            label.len()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let identity = NodeIdentity::load_or_create(&dir, "test-node").unwrap();
        let data_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        Arc::new(NodeState::new(NodeConfig::default(), identity, data_socket, inbound_tx))
    }

    #[tokio::test]
    async fn status_reports_node_identity() {
        let state = test_state("status").await;
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["node"]["name"], "test-node");
        assert_eq!(json["connections"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn add_then_list_then_remove_rule() {
        let state = test_state("rules").await;
        let router = build_router(state);

        let rule = serde_json::json!({
            "rule_id": 1,
            "source": { "owner": Value::Null, "device_id": 1 },
            "dest": { "owner": Value::Null, "device_id": 2 },
            "priority": 0,
            "enabled": true,
            "channel_filter": Value::Null,
            "message_type_filter": Value::Null,
        });
        let add_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rules")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&rule).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(add_response.status(), StatusCode::CREATED);

        let list_response = router
            .clone()
            .oneshot(Request::builder().uri("/rules").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(list_response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["rules"].as_array().unwrap().len(), 1);

        let remove_response = router
            .oneshot(Request::builder().method("DELETE").uri("/rules/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(remove_response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn devices_lists_local_and_empty_remote_with_no_peers() {
        let state = test_state("devices").await;
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().uri("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["local"].as_array().unwrap().len(), 0);
        assert_eq!(json["remote"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_rule_is_not_found() {
        let state = test_state("missing-rule").await;
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().method("DELETE").uri("/rules/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
