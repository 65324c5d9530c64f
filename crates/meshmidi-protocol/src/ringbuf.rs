/// Lock-free SPSC (single-producer, single-consumer) ring buffer for the
/// real-time MIDI hot path.
///
/// Design goals:
///   - Zero heap allocation after creation (all slots pre-allocated)
///   - Cache-line friendly: head and tail on separate cache lines to avoid
///     false sharing
///   - Bounded: fixed capacity (default 2048, a power of two), oldest
///     messages dropped on overflow — real-time MIDI favors freshness over
///     completeness
///   - Paired with `tokio::sync::Notify` for async consumer wakeup
///
/// Safety: SPSC only. One thread calls `push`/`push_overwrite`, one thread
/// calls `pop`/`try_pop`. Using it with multiple producers or consumers is
/// undefined behavior.
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A ring slot holds one MIDI message: a status byte, up to 3 data bytes,
/// the originating device id, and a microsecond timestamp. 11 bytes total,
/// within the 11-16 byte record budget for the real-time path.
#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    status: u8,
    data: [u8; 3],
    len: u8,
    device_id: u16,
    timestamp_us: u32,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            status: 0,
            data: [0; 3],
            len: 0,
            device_id: 0,
            timestamp_us: 0,
        }
    }
}

const CACHE_LINE: usize = 64;

#[repr(C)]
struct RingInner {
    head: AtomicUsize,
    _pad_head: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    tail: AtomicUsize,
    _pad_tail: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    slots: Box<[UnsafeCell<Slot>]>,
    capacity: usize,
    dropped: AtomicUsize,
}

// SAFETY: SPSC contract — head is only written by the producer, tail only by
// the consumer; atomics provide the needed memory ordering across threads.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

impl RingInner {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "ring buffer capacity must be a power of two"
        );
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(Slot::default()));
        }
        Self {
            head: AtomicUsize::new(0),
            _pad_head: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            tail: AtomicUsize::new(0),
            _pad_tail: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            slots: slots.into_boxed_slice(),
            capacity,
            dropped: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn write_slot(&self, idx: usize, midi: &[u8], device_id: u16, timestamp_us: u32) {
        let len = midi.len().saturating_sub(1).min(3) as u8;
        let status = midi.first().copied().unwrap_or(0);
        let mut data = [0u8; 3];
        if midi.len() > 1 {
            let n = (midi.len() - 1).min(3);
            data[..n].copy_from_slice(&midi[1..1 + n]);
        }
        // SAFETY: only the producer writes to `head`'s slot; the consumer
        // never touches it until `head` has been advanced past it.
        unsafe {
            let slot = &mut *self.slots[idx].get();
            slot.status = status;
            slot.data = data;
            slot.len = len;
            slot.device_id = device_id;
            slot.timestamp_us = timestamp_us;
        }
    }

    #[inline]
    fn push(&self, midi: &[u8], device_id: u16, timestamp_us: u32) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity {
            return false;
        }
        let idx = head & (self.capacity - 1);
        self.write_slot(idx, midi, device_id, timestamp_us);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    #[inline]
    fn push_overwrite(&self, midi: &[u8], device_id: u16, timestamp_us: u32) {
        if !self.push(midi, device_id, timestamp_us) {
            let tail = self.tail.load(Ordering::Relaxed);
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.push(midi, device_id, timestamp_us);
        }
    }

    #[inline]
    fn pop(&self) -> Option<(Vec<u8>, u16, u32)> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let idx = tail & (self.capacity - 1);
        // SAFETY: the consumer is the sole reader of this slot; the producer
        // has already moved past it (head > tail).
        let (status, data, len, device_id, timestamp_us) = unsafe {
            let slot = &*self.slots[idx].get();
            (slot.status, slot.data, slot.len, slot.device_id, slot.timestamp_us)
        };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        let mut midi = Vec::with_capacity(1 + len as usize);
        midi.push(status);
        midi.extend_from_slice(&data[..len as usize]);
        Some((midi, device_id, timestamp_us))
    }

    #[inline]
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }
}

pub struct RingProducer {
    inner: Arc<RingInner>,
    notify: Arc<tokio::sync::Notify>,
}

pub struct RingConsumer {
    inner: Arc<RingInner>,
    notify: Arc<tokio::sync::Notify>,
}

unsafe impl Send for RingProducer {}
unsafe impl Send for RingConsumer {}

/// Create a ring buffer pair. `capacity` must be a power of two;
/// `RING_BUFFER_CAPACITY` (2048) is the default used by the real-time
/// transport.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let inner = Arc::new(RingInner::new(capacity));
    let notify = Arc::new(tokio::sync::Notify::new());
    (
        RingProducer {
            inner: Arc::clone(&inner),
            notify: Arc::clone(&notify),
        },
        RingConsumer { inner, notify },
    )
}

impl RingProducer {
    /// Push a message; returns false if the buffer was full (no drop).
    #[inline]
    pub fn push(&self, midi: &[u8], device_id: u16, timestamp_us: u32) -> bool {
        let ok = self.inner.push(midi, device_id, timestamp_us);
        if ok {
            self.notify.notify_one();
        }
        ok
    }

    /// Push a message, dropping the oldest entry on overflow. Always
    /// succeeds — real-time MIDI favors availability over completeness.
    #[inline]
    pub fn push_overwrite(&self, midi: &[u8], device_id: u16, timestamp_us: u32) {
        self.inner.push_overwrite(midi, device_id, timestamp_us);
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl RingConsumer {
    #[inline]
    pub fn try_pop(&self) -> Option<(Vec<u8>, u16, u32)> {
        self.inner.pop()
    }

    pub async fn pop(&self) -> (Vec<u8>, u16, u32) {
        loop {
            if let Some(item) = self.inner.pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Drain up to `max` available messages, calling `f` for each. Used by
    /// the real-time transport's batching consumer loop.
    pub fn drain(&self, max: usize, mut f: impl FnMut(Vec<u8>, u16, u32)) -> usize {
        let mut n = 0;
        while n < max {
            match self.inner.pop() {
                Some((midi, device_id, ts)) => {
                    f(midi, device_id, ts);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.len()
    }

    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_basic() {
        let (producer, consumer) = ring_buffer(16);
        assert!(producer.push(&[0x90, 60, 100], 3, 111));
        let (midi, device_id, ts) = consumer.try_pop().unwrap();
        assert_eq!(midi, vec![0x90, 60, 100]);
        assert_eq!(device_id, 3);
        assert_eq!(ts, 111);
    }

    #[test]
    fn empty_returns_none() {
        let (_p, c) = ring_buffer(16);
        assert!(c.try_pop().is_none());
    }

    #[test]
    fn full_buffer_rejects() {
        let (p, _c) = ring_buffer(4);
        for i in 0..4u8 {
            assert!(p.push(&[0x90, i, 100], 0, 0));
        }
        assert!(!p.push(&[0x90, 9, 100], 0, 0));
    }

    #[test]
    fn overwrite_drops_oldest() {
        let (p, c) = ring_buffer(4);
        for i in 0..5u8 {
            p.push_overwrite(&[0x90, i, 0], 0, 0);
        }
        assert_eq!(p.dropped(), 1);
        let (midi, _, _) = c.try_pop().unwrap();
        assert_eq!(midi[1], 1, "oldest entry (index 0) should have been dropped");
    }

    #[test]
    fn fifo_order_and_wraparound() {
        let (p, c) = ring_buffer(4);
        for round in 0u8..10 {
            for j in 0u8..4 {
                assert!(p.push(&[0x80, round, j], j as u16, 0));
            }
            for j in 0u8..4 {
                let (midi, device_id, _) = c.try_pop().unwrap();
                assert_eq!(midi[2], j);
                assert_eq!(device_id, j as u16);
            }
        }
    }

    #[test]
    fn drain_batches_up_to_max() {
        let (p, c) = ring_buffer(16);
        for i in 0..10u8 {
            p.push(&[0x90, i, 0], 0, 0);
        }
        let mut seen = Vec::new();
        let n = c.drain(5, |midi, _, _| seen.push(midi[1]));
        assert_eq!(n, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(c.available(), 5);
    }
}
