/// Shared routing data types: the mesh-wide device address, device metadata,
/// and the declarative rules the router evaluates per inbound message.
///
/// Rule matching itself lives in `meshmidi-node::router` — this module only
/// carries the serializable shape so the control surface and the CLI can
/// read/write rules without depending on the node crate.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::uuid::NodeUuid;

/// A mesh-wide unique device address: the owning node plus a node-local id.
/// `owner == None` means the device is attached to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub owner: Option<NodeUuid>,
    pub device_id: u16,
}

impl DeviceKey {
    pub fn local(device_id: u16) -> Self {
        Self {
            owner: None,
            device_id,
        }
    }

    pub fn remote(owner: NodeUuid, device_id: u16) -> Self {
        Self {
            owner: Some(owner),
            device_id,
        }
    }

    pub fn is_local(&self) -> bool {
        self.owner.is_none()
    }

    /// Resolve a `None` owner against the local node's own uuid, so two
    /// `DeviceKey`s that refer to the same device compare equal regardless
    /// of which side produced them.
    pub fn canonical(&self, local_uuid: NodeUuid) -> Self {
        Self {
            owner: Some(self.owner.unwrap_or(local_uuid)),
            device_id: self.device_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: u16,
    pub name: String,
    pub direction: DeviceDirection,
    pub owner: Option<NodeUuid>,
}

/// A single forwarding rule: messages arriving from `source` matching the
/// optional filters are delivered to `dest`. Multiple enabled rules with the
/// same source may match the same message — all of them fire (fan-out).
#[derive(Debug, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: u32,
    pub source: DeviceKey,
    pub dest: DeviceKey,
    pub priority: i32,
    pub enabled: bool,
    #[serde(default)]
    pub channel_filter: Option<HashSet<u8>>,
    #[serde(default)]
    pub message_type_filter: Option<HashSet<u8>>,
    #[serde(skip)]
    pub stats: RuleStatistics,
}

impl RoutingRule {
    pub fn new(rule_id: u32, source: DeviceKey, dest: DeviceKey, priority: i32) -> Self {
        Self {
            rule_id,
            source,
            dest,
            priority,
            enabled: true,
            channel_filter: None,
            message_type_filter: None,
            stats: RuleStatistics::default(),
        }
    }

    /// Whether `bytes` (a single MIDI message, first byte is status) passes
    /// this rule's channel/message-type filters. Does not check `enabled` or
    /// `source` — callers are expected to have matched those already.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        let Some(&status) = bytes.first() else {
            return false;
        };

        if let Some(ref filter) = self.message_type_filter {
            if !filter.contains(&status) {
                return false;
            }
        }

        if let Some(ref filter) = self.channel_filter {
            if status < 0xF0 {
                let channel = status & 0x0F;
                if !filter.contains(&channel) {
                    return false;
                }
            }
        }

        true
    }
}

/// Per-rule counters, exported through the control surface's `/rules`.
#[derive(Debug, Default, Serialize)]
pub struct RuleStatistics {
    pub messages_routed: AtomicU64,
    pub messages_dropped: AtomicU64,
}

impl RuleStatistics {
    pub fn record_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Mesh-wide router counters, exported through `/status`.
#[derive(Debug, Default, Serialize)]
pub struct RouterStatistics {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub loops_detected: AtomicU64,
    pub hops_exceeded: AtomicU64,
    pub no_route: AtomicU64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_channel_filter() {
        let mut rule = RoutingRule::new(1, DeviceKey::local(1), DeviceKey::local(2), 0);
        rule.channel_filter = Some([0u8, 1].into_iter().collect());
        assert!(rule.matches(&[0x90, 60, 100])); // channel 0
        assert!(!rule.matches(&[0x92, 60, 100])); // channel 2, excluded
    }

    #[test]
    fn rule_matches_message_type_filter() {
        let mut rule = RoutingRule::new(1, DeviceKey::local(1), DeviceKey::local(2), 0);
        rule.message_type_filter = Some([0x90u8].into_iter().collect());
        assert!(rule.matches(&[0x90, 60, 100]));
        assert!(!rule.matches(&[0xB0, 7, 127]));
    }

    #[test]
    fn canonical_resolves_local_owner() {
        let local = NodeUuid::generate();
        let key = DeviceKey::local(5);
        assert_eq!(key.canonical(local), DeviceKey::remote(local, 5));
    }
}
