/// Per-peer connection handle: the public face of the SEDA connection
/// worker. Callers never touch the worker's internal state directly — they
/// send `Command`s, ask `Query`s, or read the lock-free atomic snapshot for
/// state and heartbeat age.
pub mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use meshmidi_protocol::error::ConnectionError;
use meshmidi_protocol::packet::MidiPacket;
use meshmidi_protocol::ringbuf::RingProducer;
use meshmidi_protocol::routing::DeviceInfo;
use meshmidi_protocol::uuid::NodeUuid;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

impl ConnectionState {
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Failed => 2,
            ConnectionState::Disconnected => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// One full message arriving from a peer, handed up to the router once the
/// connection worker has fully decoded it (reassembling fragments first,
/// when it arrived over the reliable path).
#[derive(Debug)]
pub enum InboundEvent {
    Midi { from: NodeUuid, packet: MidiPacket },
    RemoteDevices { from: NodeUuid, devices: Vec<DeviceInfo> },
    PeerFailed { peer: NodeUuid },
}

/// Commands the worker processes one at a time, in arrival order — this is
/// the SEDA discipline: no other task ever touches the connection's mutable
/// state directly.
pub enum Command {
    SendReliable(MidiPacket),
    /// A real-time message that already carries a `ForwardingContext` (it
    /// arrived from another peer and is being relayed onward). Sent through
    /// the command channel rather than the lock-free ring buffer because the
    /// ring buffer's fixed slot layout has no room for the context bytes —
    /// see `Router::dispatch_one`.
    SendRealtime(MidiPacket),
    AnnounceDevices(Vec<DeviceInfo>),
    InboundDatagram(Vec<u8>),
    CheckHeartbeat,
    Disconnect,
}

pub enum Query {
    State(oneshot::Sender<ConnectionState>),
    RemoteDevices(oneshot::Sender<Vec<DeviceInfo>>),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ConnectionHandle {
    pub remote_uuid: NodeUuid,
    pub remote_name: String,
    pub control_addr: SocketAddr,
    pub data_addr: SocketAddr,
    pub realtime_tx: RingProducer,
    cmd_tx: mpsc::Sender<Command>,
    query_tx: mpsc::Sender<Query>,
    state: Arc<AtomicU8>,
    last_heartbeat_recv_ms: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote_uuid: NodeUuid,
        remote_name: String,
        control_addr: SocketAddr,
        data_addr: SocketAddr,
        realtime_tx: RingProducer,
        cmd_tx: mpsc::Sender<Command>,
        query_tx: mpsc::Sender<Query>,
        state: Arc<AtomicU8>,
        last_heartbeat_recv_ms: Arc<AtomicU64>,
        last_error: Arc<Mutex<Option<String>>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
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
        }
    }

    /// Lock-free snapshot read — safe to call from any task, any number of
    /// times, without touching the worker.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn heartbeat_age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_heartbeat_recv_ms.load(Ordering::Relaxed))
    }

    pub fn note_heartbeat_received(&self) {
        self.last_heartbeat_recv_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Last fatal error this connection hit, if any — surfaced on `/status`
    /// alongside the aggregate counters.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error poisoned").clone()
    }

    pub async fn send_reliable(&self, packet: MidiPacket) -> Result<(), ConnectionError> {
        self.cmd_tx
            .send(Command::SendReliable(packet))
            .await
            .map_err(|_| ConnectionError::NotConnected(format!("{:?}", self.state())))
    }

    /// Best-effort, non-blocking send of a context-bearing real-time packet.
    /// Uses `try_send` rather than `send` so a backed-up connection drops the
    /// message instead of stalling the router's synchronous dispatch path.
    pub fn try_send_realtime(&self, packet: MidiPacket) -> Result<(), ConnectionError> {
        self.cmd_tx
            .try_send(Command::SendRealtime(packet))
            .map_err(|_| ConnectionError::NotConnected(format!("{:?}", self.state())))
    }

    pub async fn announce_devices(&self, devices: Vec<DeviceInfo>) -> Result<(), ConnectionError> {
        self.cmd_tx
            .send(Command::AnnounceDevices(devices))
            .await
            .map_err(|_| ConnectionError::NotConnected(format!("{:?}", self.state())))
    }

    pub async fn inbound_datagram(&self, data: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::InboundDatagram(data)).await;
    }

    pub async fn check_heartbeat(&self) {
        let _ = self.cmd_tx.send(Command::CheckHeartbeat).await;
    }

    /// Composite query bounded by a 1 s deadline: the worker may be busy
    /// draining a backlog of commands ahead of this one, and a caller
    /// (control API, router) should get a safe default rather than block
    /// indefinitely on it.
    pub async fn remote_devices(&self) -> Result<Vec<DeviceInfo>, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(Query::RemoteDevices(tx))
            .await
            .map_err(|_| ConnectionError::NotConnected(format!("{:?}", self.state())))?;
        tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .map_err(|_| ConnectionError::QueryTimeout)?
            .map_err(|_| ConnectionError::QueryTimeout)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
