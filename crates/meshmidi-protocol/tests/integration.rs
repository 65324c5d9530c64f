/// Cross-module integration tests for the wire protocol: packet framing,
/// forwarding-context loop-prevention data, the real-time ring buffer under
/// concurrent push/pop, and non-real-time fragmentation/reassembly.
use meshmidi_protocol::classifier::{classify, MessageClass};
use meshmidi_protocol::config::NodeConfig;
use meshmidi_protocol::forwarding::ForwardingContext;
use meshmidi_protocol::packet::MidiPacket;
use meshmidi_protocol::ringbuf::ring_buffer;
use meshmidi_protocol::routing::{DeviceKey, RoutingRule};
use meshmidi_protocol::transport_frame::{segment, FeedOutcome, Reassembler};
use meshmidi_protocol::uuid::NodeUuid;
use meshmidi_protocol::MAX_HOPS;

// --- 1. Packet + forwarding-context roundtrip through the wire format ---

#[test]
fn packet_carries_forwarding_context_end_to_end() {
    let mut ctx = ForwardingContext::new();
    ctx.push((0xAAAA_BBBB, 2)).unwrap();
    ctx.push((0xCCCC_DDDD, 5)).unwrap();

    let mut packet = MidiPacket::new(1, 2, 7, vec![0x90, 64, 100]);
    packet.context = Some(ctx);

    let mut wire = Vec::new();
    packet.serialize(&mut wire);

    let decoded = MidiPacket::deserialize(&wire).unwrap();
    let decoded_ctx = decoded.context.expect("context flag should round-trip");
    assert_eq!(decoded_ctx.hop_count, 2);
    assert_eq!(decoded.payload, vec![0x90, 64, 100]);
}

// --- 2. Loop-detection data: a device that reappears in `visited` ---

#[test]
fn revisit_of_already_visited_device_is_detectable() {
    let mut ctx = ForwardingContext::new();
    let a = (111, 2);
    let b = (222, 5);
    ctx.push(a).unwrap();
    ctx.push(b).unwrap();

    assert!(ctx.contains(a), "router must be able to detect a's return leg");
    assert!(!ctx.contains((333, 9)));
}

// --- 3. Max-hops boundary: the MAX_HOPS'th hop is fine, the next is not ---

#[test]
fn hop_limit_boundary() {
    let mut ctx = ForwardingContext::new();
    for i in 0..MAX_HOPS {
        assert!(!ctx.is_at_hop_limit());
        ctx.push((i as u32, i as u16)).unwrap();
    }
    assert!(ctx.is_at_hop_limit());
    assert!(ctx.push((99, 99)).is_err());
}

// --- 4. Classifier feeds directly into routing-rule message-type filters ---

#[test]
fn classifier_and_rule_filter_agree_on_sysex() {
    let sysex = [0xF0u8, 0x7E, 0x7F, 0x06, 0x01, 0xF7];
    assert_eq!(classify(&sysex), MessageClass::NonRealTime);

    let mut rule = RoutingRule::new(1, DeviceKey::local(1), DeviceKey::local(2), 10);
    rule.message_type_filter = Some([0xF0u8].into_iter().collect());
    assert!(rule.matches(&sysex));
}

// --- 5. Ring buffer under a producer/consumer task pair ---

#[tokio::test]
async fn ring_buffer_delivers_messages_to_async_consumer() {
    let (producer, consumer) = ring_buffer(256);

    let writer = tokio::spawn(async move {
        for i in 0..100u8 {
            producer.push(&[0x90, i, 100], 1, i as u32);
        }
    });

    writer.await.unwrap();

    let mut received = Vec::new();
    for _ in 0..100 {
        let (midi, _device, _ts) = consumer.pop().await;
        received.push(midi[1]);
    }
    assert_eq!(received, (0u8..100).collect::<Vec<_>>());
}

// --- 6. SysEx reliability: a 5000-byte payload reassembles identically ---

#[test]
fn large_sysex_roundtrips_through_fragmentation() {
    let mut payload = vec![0xF0];
    payload.extend((0u8..=255).cycle().take(4998));
    payload.push(0xF7);
    assert_eq!(payload.len(), 5000);

    let fragments = segment(&payload, 0);
    assert_eq!(fragments.len(), 5);

    let mut reassembler = Reassembler::new();
    let mut result = FeedOutcome::Pending;
    for f in fragments {
        result = reassembler.feed(f);
    }
    assert_eq!(result, FeedOutcome::Complete(payload));
}

// --- 7. Config defaults are self-consistent with the documented runtime options ---

#[test]
fn default_config_matches_documented_runtime_options() {
    let cfg = NodeConfig::default();
    assert!(cfg.discovery.auto_connect);
    assert_eq!(cfg.routing.max_hops, MAX_HOPS);
    assert!(cfg.routing.enable_forwarding_context);
    assert_eq!(cfg.handshake.retry_attempts, 3);
}

// --- 8. DeviceKey canonicalization lets local and remote views compare equal ---

#[test]
fn device_key_canonicalization_unifies_local_and_remote_views() {
    let node = NodeUuid::generate();
    let as_seen_locally = DeviceKey::local(4);
    let as_seen_remotely = DeviceKey::remote(node, 4);
    assert_eq!(as_seen_locally.canonical(node), as_seen_remotely);
}
