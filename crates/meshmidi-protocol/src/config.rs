/// On-disk node configuration, loaded once at startup via `toml`. Every
/// field has a default so a missing or partial config file is always valid
/// — the same `#[serde(default = "...")]` idiom the reference daemons use
/// for their config structs.
use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_HANDSHAKE_RETRY_ATTEMPTS,
    DEFAULT_HANDSHAKE_RETRY_DELAY_MS, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_MULTICAST_GROUP, MAX_HOPS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub network: NetworkSection,
    pub discovery: DiscoverySection,
    pub handshake: HandshakeSection,
    pub heartbeat: HeartbeatSection,
    pub routing: RoutingSection,
    pub control: ControlSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            network: NetworkSection::default(),
            discovery: DiscoverySection::default(),
            handshake: HandshakeSection::default(),
            heartbeat: HeartbeatSection::default(),
            routing: RoutingSection::default(),
            control: ControlSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,
    pub state_dir: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            state_dir: "/var/lib/meshmidi".to_string(),
        }
    }
}

fn default_node_name() -> String {
    hostname_fallback()
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "meshmidi-node".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub interface: String,
    pub data_port: u16,
    pub control_port: u16,
    pub discovery_port: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            data_port: DEFAULT_DATA_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub auto_connect: bool,
    pub device_name_filter: String,
    pub mdns_enabled: bool,
    pub multicast_group: String,
    pub multicast_announce_interval_s: u64,
    pub multicast_peer_timeout_s: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            auto_connect: true,
            device_name_filter: String::new(),
            mdns_enabled: true,
            multicast_group: DEFAULT_MULTICAST_GROUP.to_string(),
            multicast_announce_interval_s: 5,
            multicast_peer_timeout_s: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSection {
    pub inquiry_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            inquiry_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            retry_attempts: DEFAULT_HANDSHAKE_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_HANDSHAKE_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub max_hops: u8,
    pub enable_forwarding_context: bool,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            max_hops: MAX_HOPS,
            enable_forwarding_context: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub listen: String,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_CONTROL_PORT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.network.data_port, DEFAULT_DATA_PORT);
        assert_eq!(cfg.heartbeat.timeout_ms, DEFAULT_HEARTBEAT_TIMEOUT_MS);
        assert!(cfg.discovery.auto_connect);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let toml_str = r#"
            [network]
            data_port = 6000

            [heartbeat]
            timeout_ms = 9000
        "#;
        let cfg = NodeConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.network.data_port, 6000);
        assert_eq!(cfg.network.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(cfg.heartbeat.timeout_ms, 9000);
        assert_eq!(cfg.heartbeat.interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
    }
}
