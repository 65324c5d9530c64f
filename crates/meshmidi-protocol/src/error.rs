use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("malformed discovery record: {0}")]
    MalformedRecord(String),
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out after {0}ms")]
    Timeout(u64),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("handshake reached the wrong peer: expected {expected}, got {got}")]
    WrongPeer { expected: String, got: String },

    #[error("malformed handshake message: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection is not in the Connected state (current: {0})")]
    NotConnected(String),

    #[error("duplicate connection for peer {0}")]
    Duplicate(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("connection worker did not respond within the query deadline")]
    QueryTimeout,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("best-effort send failed: {0}")]
    SendFailed(String),

    #[error("fragment {sequence} exceeded retry budget ({retries} attempts)")]
    AckTimeout { sequence: u32, retries: u32 },

    #[error("reassembly buffer exceeded its cap for sequence group {0}")]
    ReassemblyCapExceeded(u32),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad magic bytes in packet header")]
    BadMagic,

    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),

    #[error("malformed forwarding context extension")]
    BadContext,

    #[error("node hash collision detected for hash {0:#010x}")]
    HashCollision(u32),

    #[error("packet truncated: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no route to device {0:?}")]
    NoRoute(crate::routing::DeviceKey),

    #[error("forwarding loop detected at device {0:?}")]
    LoopDetected(crate::routing::DeviceKey),

    #[error("forwarding context exceeded MAX_HOPS ({0})")]
    HopsExceeded(u8),

    #[error("classifier could not determine message class for status byte {0:#04x}")]
    ClassifierUnknown(u8),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("operation {op} is invalid in state {state}")]
    InvalidStateForOperation { op: String, state: String },
}
