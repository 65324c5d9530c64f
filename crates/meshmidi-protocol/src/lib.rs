pub mod classifier;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod identity;
pub mod packet;
pub mod ringbuf;
pub mod routing;
pub mod transport_frame;
pub mod uuid;

/// Wire protocol version carried in every packet header.
pub const PROTOCOL_VERSION: u8 = 1;

/// mDNS service type nodes advertise themselves under.
pub const MDNS_SERVICE_TYPE: &str = "_midi-network._tcp.local.";

/// Fallback UDP multicast group used when mDNS is unavailable.
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.42.99";

/// Default ports.
pub const DEFAULT_CONTROL_PORT: u16 = 7070;
pub const DEFAULT_DATA_PORT: u16 = 5104;
pub const DEFAULT_DISCOVERY_PORT: u16 = 5108;

/// Mesh-wide forwarding cap (hop count before a packet is rejected).
pub const MAX_HOPS: u8 = 8;

/// Heartbeat defaults.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 3_000;

/// Handshake defaults.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HANDSHAKE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_HANDSHAKE_RETRY_DELAY_MS: u64 = 1_000;

/// Non-real-time transport defaults.
pub const FRAGMENT_MAX_PAYLOAD: usize = 1024;
pub const FRAGMENT_RETRY_INTERVAL_MS: u64 = 1_000;
pub const FRAGMENT_MAX_RETRIES: u32 = 3;

/// Real-time ring buffer capacity (slots), must be a power of two.
pub const RING_BUFFER_CAPACITY: usize = 2048;

/// Per-connection cap on how many out-of-order bytes a `Reassembler` will
/// buffer for one payload before giving up (§4.3, §7 `ReassemblyCapExceeded`).
pub const REASSEMBLY_CAP_BYTES: usize = 64 * 1024;
