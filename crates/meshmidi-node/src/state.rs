/// Shared state bundled behind one `Arc`, the same shape the reference host
/// daemon uses for its `SharedState`: config and identity loaded once at
/// startup, everything else built up as subsystems come online and cloned
/// into each spawned task.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use meshmidi_device::MidiPort;
use meshmidi_protocol::config::NodeConfig;
use meshmidi_protocol::identity::NodeIdentity;
use meshmidi_protocol::routing::DeviceInfo;
use meshmidi_protocol::uuid::NodeUuid;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionHandle, InboundEvent};
use crate::metrics::NodeMetrics;
use crate::router::Router;
use crate::uuid_registry::UuidRegistry;

pub struct NodeState {
    pub config: NodeConfig,
    pub identity: NodeIdentity,
    pub registry: UuidRegistry,
    pub router: Router,
    pub metrics: Arc<NodeMetrics>,
    pub pool: RwLock<HashMap<NodeUuid, Arc<ConnectionHandle>>>,
    pub local_ports: RwLock<HashMap<u16, Arc<dyn MidiPort>>>,
    pub local_devices: RwLock<Vec<DeviceInfo>>,
    pub data_socket: Arc<UdpSocket>,
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    /// Cancelled once on shutdown; every long-running task selects on this
    /// alongside its own work so Ctrl-C drains cleanly instead of aborting
    /// tasks mid-operation.
    pub shutdown: CancellationToken,
}

impl NodeState {
    pub fn new(
        config: NodeConfig,
        identity: NodeIdentity,
        data_socket: Arc<UdpSocket>,
        inbound_tx: mpsc::Sender<InboundEvent>,
    ) -> Self {
        let max_hops = config.routing.max_hops;
        let forwarding_context_enabled = config.routing.enable_forwarding_context;
        Self {
            router: Router::new(identity.uuid, max_hops, forwarding_context_enabled),
            registry: UuidRegistry::new(),
            metrics: Arc::new(NodeMetrics::default()),
            pool: RwLock::new(HashMap::new()),
            local_ports: RwLock::new(HashMap::new()),
            local_devices: RwLock::new(Vec::new()),
            config,
            identity,
            data_socket,
            inbound_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn connection(&self, uuid: NodeUuid) -> Option<Arc<ConnectionHandle>> {
        self.pool.read().expect("connection pool poisoned").get(&uuid).cloned()
    }

    pub fn connections_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.pool.read().expect("connection pool poisoned").values().cloned().collect()
    }

    pub fn insert_connection(&self, handle: Arc<ConnectionHandle>) {
        self.pool
            .write()
            .expect("connection pool poisoned")
            .insert(handle.remote_uuid, handle);
    }

    pub fn remove_connection(&self, uuid: NodeUuid) {
        if let Some(handle) = self.pool.write().expect("connection pool poisoned").remove(&uuid) {
            handle.abort();
        }
        self.registry.unregister(uuid);
    }
}
