/// Mesh-wide counters served by the control surface's `/status` endpoint.
/// Grounded on the reference host daemon's `metrics.rs` snapshot pattern:
/// plain atomics aggregated into a serializable struct on read.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct NodeMetrics {
    pub messages_routed: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub udp_send_failures: AtomicU64,
    pub delivery_failed: AtomicU64,
    pub hops_exceeded: AtomicU64,
    pub loops_detected: AtomicU64,
    pub no_route: AtomicU64,
    pub ring_dropped: AtomicU64,
    pub handshakes_succeeded: AtomicU64,
    pub handshakes_failed: AtomicU64,
    pub reassembly_cap_exceeded: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub udp_send_failures: u64,
    pub delivery_failed: u64,
    pub hops_exceeded: u64,
    pub loops_detected: u64,
    pub no_route: u64,
    pub ring_dropped: u64,
    pub handshakes_succeeded: u64,
    pub handshakes_failed: u64,
    pub reassembly_cap_exceeded: u64,
}

impl NodeMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            udp_send_failures: self.udp_send_failures.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            hops_exceeded: self.hops_exceeded.load(Ordering::Relaxed),
            loops_detected: self.loops_detected.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            ring_dropped: self.ring_dropped.load(Ordering::Relaxed),
            handshakes_succeeded: self.handshakes_succeeded.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            reassembly_cap_exceeded: self.reassembly_cap_exceeded.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
