/// Discovery events shared by both concrete backends (mDNS and UDP
/// multicast fallback), plumbed behind a `DiscoveryProvider` trait so
/// `main.rs` spawns "whichever backends are configured" without knowing
/// their concrete types.
pub mod mdns;
pub mod multicast;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use meshmidi_protocol::uuid::NodeUuid;
use tokio::sync::mpsc;

use crate::state::NodeState;

#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub uuid: NodeUuid,
    pub name: String,
    pub control_addr: SocketAddr,
    pub data_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(DiscoveredPeer),
    Removed(NodeUuid),
}

/// One advertise-and-browse backend. Each implementation owns its whole
/// task lifetime: it runs until `state.shutdown` fires or it hits an
/// unrecoverable error, emitting `DiscoveryEvent`s as peers come and go.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, state: Arc<NodeState>, events: mpsc::Sender<DiscoveryEvent>) -> anyhow::Result<()>;
}

pub struct MdnsProvider;

#[async_trait]
impl DiscoveryProvider for MdnsProvider {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn run(&self, state: Arc<NodeState>, events: mpsc::Sender<DiscoveryEvent>) -> anyhow::Result<()> {
        mdns::run(state, events).await
    }
}

pub struct MulticastProvider;

#[async_trait]
impl DiscoveryProvider for MulticastProvider {
    fn name(&self) -> &'static str {
        "multicast"
    }

    async fn run(&self, state: Arc<NodeState>, events: mpsc::Sender<DiscoveryEvent>) -> anyhow::Result<()> {
        multicast::run(state, events).await
    }
}
