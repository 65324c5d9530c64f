/// Wire framing for the non-real-time (reliable) transport: payloads larger
/// than a fragment are segmented, each fragment is tracked until
/// acknowledged, and the receiver reassembles by sequence number.
///
/// Frame format (fragment):
///   0  magic     [u8;2]  = b"MN"
///   2  sequence  u32     monotonic per connection
///   6  length    u16     payload length, <= FRAGMENT_MAX_PAYLOAD
///   8  flags     u8      bit0 = last fragment in this payload
///   9  payload   [u8; length]
///
/// Frame format (ack), 6 bytes total:
///   0  magic     [u8;2]  = b"AK"
///   2  sequence  u32     the fragment sequence being acknowledged
use crate::FRAGMENT_MAX_PAYLOAD;

pub const MAGIC_FRAGMENT: [u8; 2] = *b"MN";
pub const MAGIC_ACK: [u8; 2] = *b"AK";

pub const FRAGMENT_HEADER_SIZE: usize = 9;
pub const ACK_FRAME_SIZE: usize = 6;

pub const FLAG_LAST_FRAGMENT: u8 = 0b0000_0001;

#[derive(Debug, Clone)]
pub struct Fragment {
    pub sequence: u32,
    pub last: bool,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&MAGIC_FRAGMENT);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.push(if self.last { FLAG_LAST_FRAGMENT } else { 0 });
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        if data[0..2] != MAGIC_FRAGMENT {
            return None;
        }
        let sequence = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let length = u16::from_be_bytes([data[6], data[7]]) as usize;
        let flags = data[8];
        if length > FRAGMENT_MAX_PAYLOAD || data.len() < FRAGMENT_HEADER_SIZE + length {
            return None;
        }
        let payload = data[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + length].to_vec();
        Some(Self {
            sequence,
            last: flags & FLAG_LAST_FRAGMENT != 0,
            payload,
        })
    }
}

/// Split `payload` into fragments of at most `FRAGMENT_MAX_PAYLOAD` bytes,
/// each assigned a sequence number starting at `first_sequence`.
pub fn segment(payload: &[u8], first_sequence: u32) -> Vec<Fragment> {
    if payload.is_empty() {
        return vec![Fragment {
            sequence: first_sequence,
            last: true,
            payload: Vec::new(),
        }];
    }
    let mut fragments = Vec::new();
    let mut offset = 0;
    let mut seq = first_sequence;
    while offset < payload.len() {
        let end = (offset + FRAGMENT_MAX_PAYLOAD).min(payload.len());
        fragments.push(Fragment {
            sequence: seq,
            last: end == payload.len(),
            payload: payload[offset..end].to_vec(),
        });
        offset = end;
        seq = seq.wrapping_add(1);
    }
    fragments
}

pub fn encode_ack(buf: &mut [u8; ACK_FRAME_SIZE], sequence: u32) {
    buf[0..2].copy_from_slice(&MAGIC_ACK);
    buf[2..6].copy_from_slice(&sequence.to_be_bytes());
}

pub fn decode_ack(data: &[u8]) -> Option<u32> {
    if data.len() < ACK_FRAME_SIZE || data[0..2] != MAGIC_ACK {
        return None;
    }
    Some(u32::from_be_bytes([data[2], data[3], data[4], data[5]]))
}

/// Outcome of feeding one fragment into a `Reassembler`.
#[derive(Debug, PartialEq, Eq)]
pub enum FeedOutcome {
    /// More fragments needed before the payload is complete.
    Pending,
    /// The last fragment arrived and every sequence number in the run is
    /// accounted for contiguously.
    Complete(Vec<u8>),
    /// Buffered bytes for this payload exceeded the reassembly cap; the
    /// caller should discard the reassembler and the payload is abandoned
    /// (§7 `ReassemblyCapExceeded`).
    CapExceeded,
}

/// Reassembles fragments belonging to one payload (one contiguous
/// sequence-number run terminated by `last`), buffering out-of-order
/// fragments by offset up to `cap` total bytes.
#[derive(Debug)]
pub struct Reassembler {
    pieces: Vec<(u32, Vec<u8>)>,
    complete: bool,
    total_bytes: usize,
    cap: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_cap(crate::REASSEMBLY_CAP_BYTES)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            pieces: Vec::new(),
            complete: false,
            total_bytes: 0,
            cap,
        }
    }

    /// Feed one fragment. Returns `Complete` once the last-fragment flag has
    /// arrived and every sequence number in the run is accounted for
    /// contiguously, `CapExceeded` if this fragment pushed the buffered
    /// total past `cap`, `Pending` otherwise.
    pub fn feed(&mut self, fragment: Fragment) -> FeedOutcome {
        if self.complete {
            return FeedOutcome::Pending;
        }
        self.total_bytes += fragment.payload.len();
        if self.total_bytes > self.cap {
            return FeedOutcome::CapExceeded;
        }
        self.pieces.push((fragment.sequence, fragment.payload));
        if !fragment.last {
            return FeedOutcome::Pending;
        }
        self.pieces.sort_by_key(|(seq, _)| *seq);
        // Verify contiguity: sequence numbers must be a consecutive run.
        for w in self.pieces.windows(2) {
            if w[1].0 != w[0].0.wrapping_add(1) {
                return FeedOutcome::Pending;
            }
        }
        self.complete = true;
        FeedOutcome::Complete(self.pieces.iter().flat_map(|(_, p)| p.clone()).collect())
    }

    pub fn byte_count(&self) -> usize {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_roundtrip() {
        let frag = Fragment {
            sequence: 7,
            last: true,
            payload: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        frag.encode(&mut buf);
        let decoded = Fragment::decode(&buf).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert!(decoded.last);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn ack_roundtrip() {
        let mut buf = [0u8; ACK_FRAME_SIZE];
        encode_ack(&mut buf, 99);
        assert_eq!(decode_ack(&buf), Some(99));
    }

    #[test]
    fn segment_large_sysex_matches_expected_fragment_count() {
        let payload = vec![0u8; 5000];
        let fragments = segment(&payload, 0);
        assert_eq!(fragments.len(), 5, "5000 bytes at 1024/fragment should need ceil(5000/1024)=5 fragments");
        assert!(fragments.last().unwrap().last);
        assert!(fragments[..4].iter().all(|f| !f.last));
    }

    #[test]
    fn reassembly_matches_original() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(3000).collect();
        let fragments = segment(&payload, 10);
        let mut reassembler = Reassembler::new();
        let mut result = FeedOutcome::Pending;
        for f in fragments {
            result = reassembler.feed(f);
        }
        assert_eq!(result, FeedOutcome::Complete(payload));
    }

    #[test]
    fn reassembly_rejects_gap() {
        let payload = vec![0u8; 3000];
        let mut fragments = segment(&payload, 0);
        fragments.remove(1);
        let mut reassembler = Reassembler::new();
        let mut result = FeedOutcome::Pending;
        for f in fragments {
            result = reassembler.feed(f);
        }
        assert_eq!(result, FeedOutcome::Pending);
    }

    #[test]
    fn reassembly_cap_exceeded_abandons_payload() {
        let payload = vec![0u8; 3000];
        let fragments = segment(&payload, 0);
        let mut reassembler = Reassembler::with_cap(1500);
        let mut saw_cap_exceeded = false;
        for f in fragments {
            if reassembler.feed(f) == FeedOutcome::CapExceeded {
                saw_cap_exceeded = true;
                break;
            }
        }
        assert!(saw_cap_exceeded, "feeding past the cap should report CapExceeded");
    }
}
