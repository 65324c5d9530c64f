/// The forwarding core: evaluates `RoutingRule`s against an inbound message,
/// dispatches it to every matching destination (fan-out, not first-match),
/// and guards against loops and runaway hop counts using the packet's
/// `ForwardingContext`.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use meshmidi_device::MidiPort;
use meshmidi_protocol::error::RouterError;
use meshmidi_protocol::packet::MidiPacket;
use meshmidi_protocol::routing::{DeviceKey, RouterStatistics, RoutingRule};
use meshmidi_protocol::uuid::NodeUuid;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::metrics::NodeMetrics;

pub struct RoutingTable {
    rules: RwLock<Vec<RoutingRule>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rule: RoutingRule) {
        let mut rules = self.rules.write().expect("routing table poisoned");
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn remove(&self, rule_id: u32) -> bool {
        let mut rules = self.rules.write().expect("routing table poisoned");
        let before = rules.len();
        rules.retain(|r| r.rule_id != rule_id);
        rules.len() != before
    }

    pub fn set_enabled(&self, rule_id: u32, enabled: bool) -> bool {
        let mut rules = self.rules.write().expect("routing table poisoned");
        if let Some(r) = rules.iter_mut().find(|r| r.rule_id == rule_id) {
            r.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// All enabled rules whose source matches `source`, in priority order.
    /// Several may match (fan-out): the router dispatches to every one.
    /// Returns each matching rule's id alongside its destination so the
    /// caller can attribute a failed delivery back to the rule that fired.
    fn matching(&self, source: DeviceKey, bytes: &[u8]) -> Vec<(u32, DeviceKey)> {
        let rules = self.rules.read().expect("routing table poisoned");
        rules
            .iter()
            .filter(|r| r.enabled && r.source == source && r.matches(bytes))
            .map(|r| {
                r.stats.record_routed();
                (r.rule_id, r.dest)
            })
            .collect()
    }

    /// Records a delivery failure against the rule that produced it.
    fn record_dropped(&self, rule_id: u32) {
        let rules = self.rules.read().expect("routing table poisoned");
        if let Some(r) = rules.iter().find(|r| r.rule_id == rule_id) {
            r.stats.record_dropped();
        }
    }

    pub fn snapshot(&self) -> Vec<RuleSnapshot> {
        self.rules
            .read()
            .expect("routing table poisoned")
            .iter()
            .map(|r| RuleSnapshot {
                rule_id: r.rule_id,
                source: r.source,
                dest: r.dest,
                priority: r.priority,
                enabled: r.enabled,
                messages_routed: r.stats.messages_routed.load(std::sync::atomic::Ordering::Relaxed),
                messages_dropped: r.stats.messages_dropped.load(std::sync::atomic::Ordering::Relaxed),
            })
            .collect()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RuleSnapshot {
    pub rule_id: u32,
    pub source: DeviceKey,
    pub dest: DeviceKey,
    pub priority: i32,
    pub enabled: bool,
    pub messages_routed: u64,
    pub messages_dropped: u64,
}

/// Dispatches one inbound message to its matching local ports and/or remote
/// connections. Holds no connection/device state of its own — those are
/// passed in per call so the router stays a pure evaluation step over
/// shared, independently-owned maps.
pub struct Router {
    pub table: RoutingTable,
    pub stats: RouterStatistics,
    local_uuid: NodeUuid,
    max_hops: u8,
    forwarding_context_enabled: bool,
}

impl Router {
    pub fn new(local_uuid: NodeUuid, max_hops: u8, forwarding_context_enabled: bool) -> Self {
        Self {
            table: RoutingTable::new(),
            stats: RouterStatistics::default(),
            local_uuid,
            max_hops,
            forwarding_context_enabled,
        }
    }

    /// Route one inbound MIDI packet that just arrived from `from_peer`
    /// (`None` for a message injected locally from a hardware port).
    ///
    /// `local_ports` delivers to attached hardware; `connections` forwards to
    /// mesh peers. Loop and hop-count checks use the packet's
    /// `ForwardingContext`, appending the local node before forwarding.
    pub fn route(
        &self,
        source_device: DeviceKey,
        packet: &MidiPacket,
        local_ports: &HashMap<u16, Arc<dyn MidiPort>>,
        connections: &HashMap<NodeUuid, Arc<ConnectionHandle>>,
        metrics: &NodeMetrics,
    ) {
        NodeMetrics::incr(&metrics.messages_routed);
        self.stats.messages_in.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let source = source_device.canonical(self.local_uuid);
        let destinations = self.table.matching(source, &packet.payload);

        if destinations.is_empty() {
            self.stats.no_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            NodeMetrics::incr(&metrics.no_route);
            debug!(error = %RouterError::NoRoute(source), "no routing rule matched, dropping");
            return;
        }

        for (rule_id, dest) in destinations {
            self.dispatch_one(rule_id, source, dest, packet, local_ports, connections, metrics);
        }
    }

    fn dispatch_one(
        &self,
        rule_id: u32,
        source: DeviceKey,
        dest: DeviceKey,
        packet: &MidiPacket,
        local_ports: &HashMap<u16, Arc<dyn MidiPort>>,
        connections: &HashMap<NodeUuid, Arc<ConnectionHandle>>,
        metrics: &NodeMetrics,
    ) {
        if dest.canonical(self.local_uuid).owner == Some(self.local_uuid) {
            match local_ports.get(&dest.device_id) {
                Some(port) => {
                    if let Err(e) = port.send(&packet.payload) {
                        warn!(device = dest.device_id, error = %e, "local delivery failed");
                        NodeMetrics::incr(&metrics.delivery_failed);
                        self.table.record_dropped(rule_id);
                    } else {
                        self.stats.messages_out.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                None => {
                    self.stats.no_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    NodeMetrics::incr(&metrics.no_route);
                    self.table.record_dropped(rule_id);
                    debug!(error = %RouterError::NoRoute(dest), "no local port for destination");
                }
            }
            return;
        }

        let Some(owner) = dest.owner else { return };
        let Some(conn) = connections.get(&owner) else {
            self.stats.no_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            NodeMetrics::incr(&metrics.no_route);
            self.table.record_dropped(rule_id);
            debug!(error = %RouterError::NoRoute(dest), "no connection to destination's owning node");
            return;
        };

        let mut forwarded = packet.clone();
        forwarded.dst_node_hash = owner.hash32();
        forwarded.device_id = dest.device_id;

        if self.forwarding_context_enabled {
            let mut context = packet.context.clone().unwrap_or_default();
            // The key recorded for this hop is *this* node plus the matched
            // source's device id, not the destination's — a loop is "have I
            // already sent through this inbound device at this node before",
            // checked against the key the next hop back would re-present.
            let wire_key = (self.local_uuid.hash32(), source.device_id);
            if context.contains(wire_key) {
                self.stats.loops_detected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                NodeMetrics::incr(&metrics.loops_detected);
                self.table.record_dropped(rule_id);
                warn!(error = %RouterError::LoopDetected(dest), "dropping");
                return;
            }
            if context.is_at_hop_limit() {
                self.stats.hops_exceeded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                NodeMetrics::incr(&metrics.hops_exceeded);
                self.table.record_dropped(rule_id);
                warn!(error = %RouterError::HopsExceeded(self.max_hops), ?dest, "dropping");
                return;
            }
            if context.push(wire_key).is_err() {
                NodeMetrics::incr(&metrics.hops_exceeded);
                self.table.record_dropped(rule_id);
                return;
            }
            forwarded.context = Some(context);
        } else {
            forwarded.context = None;
        }

        let class = meshmidi_protocol::classifier::classify(&packet.payload);
        match class {
            meshmidi_protocol::classifier::MessageClass::RealTime => {
                // A context-free packet is either a fresh local-origin message or
                // forwarding-context tracking is disabled: either way the lock-free
                // ring buffer's fixed slot (no room for context bytes) is safe to
                // use. A context-bearing packet is being relayed across a hop
                // already in progress and must preserve that context on the wire,
                // so it goes through the command channel instead (see
                // `Command::SendRealtime`).
                if forwarded.context.is_some() {
                    if conn.try_send_realtime(forwarded).is_err() {
                        NodeMetrics::incr(&metrics.delivery_failed);
                        self.table.record_dropped(rule_id);
                        return;
                    }
                } else {
                    conn.realtime_tx
                        .push_overwrite(&forwarded.payload, forwarded.device_id, forwarded.timestamp_us);
                }
            }
            meshmidi_protocol::classifier::MessageClass::NonRealTime => {
                let conn = Arc::clone(conn);
                tokio::spawn(async move {
                    let _ = conn.send_reliable(forwarded).await;
                });
            }
        }
        self.stats.messages_out.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmidi_protocol::routing::{DeviceDirection, RoutingRule};

    #[test]
    fn fan_out_to_multiple_rules() {
        let local = NodeUuid::generate();
        let router = Router::new(local, 8, true);
        let source = DeviceKey::local(1).canonical(local);
        router.table.add(RoutingRule::new(1, source, DeviceKey::local(2), 0));
        router.table.add(RoutingRule::new(2, source, DeviceKey::local(3), 0));

        let dests = router.table.matching(source, &[0x90, 60, 100]);
        assert_eq!(dests.len(), 2);
    }

    #[test]
    fn disabled_rule_does_not_match() {
        let local = NodeUuid::generate();
        let router = Router::new(local, 8, true);
        let source = DeviceKey::local(1).canonical(local);
        let mut rule = RoutingRule::new(1, source, DeviceKey::local(2), 0);
        rule.enabled = false;
        router.table.add(rule);
        assert!(router.table.matching(source, &[0x90, 60, 100]).is_empty());
    }

    #[test]
    fn remove_rule_by_id() {
        let local = NodeUuid::generate();
        let router = Router::new(local, 8, true);
        let source = DeviceKey::local(1).canonical(local);
        router.table.add(RoutingRule::new(5, source, DeviceKey::local(2), 0));
        assert!(router.table.remove(5));
        assert!(router.table.matching(source, &[0x90, 60, 100]).is_empty());
    }

    #[allow(dead_code)]
    fn _unused_direction(_: DeviceDirection) {}

    /// Three-node relay: a message arrives at this node already carrying a
    /// `ForwardingContext` from an earlier hop, classifies as real-time, and
    /// gets forwarded on to a second peer. The context (and its hop count)
    /// must survive onto the wire — this is the scenario `dispatch_one`'s
    /// `try_send_realtime` branch exists for, instead of the ring buffer.
    #[tokio::test]
    async fn realtime_forward_preserves_context() {
        use crate::connection::worker;
        use meshmidi_protocol::forwarding::ForwardingContext;
        use meshmidi_protocol::packet::MidiPacket;
        use meshmidi_protocol::uuid::NodeUuid;
        use tokio::net::UdpSocket;
        use tokio::sync::mpsc;

        let local_uuid = NodeUuid::generate(); // this node, "B"
        let upstream_uuid = NodeUuid::generate(); // "A", the previous hop
        let downstream_uuid = NodeUuid::generate(); // "C", where we forward to

        let data_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();

        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let handle = worker::spawn(
            local_uuid,
            downstream_uuid,
            "C".to_string(),
            peer_addr,
            peer_addr,
            Arc::clone(&data_socket),
            inbound_tx,
            30_000,
            Arc::new(NodeMetrics::default()),
            tokio_util::sync::CancellationToken::new(),
            Vec::new(),
        );

        let mut connections = HashMap::new();
        connections.insert(downstream_uuid, Arc::new(handle));
        let local_ports: HashMap<u16, Arc<dyn MidiPort>> = HashMap::new();

        let router = Router::new(local_uuid, 8, true);
        let source = DeviceKey::remote(upstream_uuid, 7).canonical(local_uuid);
        router.table.add(RoutingRule::new(1, source, DeviceKey::remote(downstream_uuid, 7), 0));

        let mut context = ForwardingContext::new();
        context.push((upstream_uuid.hash32(), 7)).unwrap();
        let mut packet = MidiPacket::new(upstream_uuid.hash32(), local_uuid.hash32(), 7, vec![0xB0, 7, 127]);
        packet.context = Some(context);

        let metrics = NodeMetrics::default();
        router.route(DeviceKey::remote(upstream_uuid, 7), &packet, &local_ports, &connections, &metrics);

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(1), peer_socket.recv_from(&mut buf))
            .await
            .expect("forwarded packet never arrived")
            .unwrap();

        let forwarded = MidiPacket::deserialize(&buf[..len]).unwrap();
        let ctx = forwarded.context.expect("forwarded real-time packet must carry its context");
        assert_eq!(ctx.hop_count, 2);
        assert!(ctx.contains((upstream_uuid.hash32(), 7)));
        assert!(ctx.contains((local_uuid.hash32(), 7)));
    }
}
