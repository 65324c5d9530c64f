/// Wire packet formats.
///
/// `MidiPacket` is the workhorse: a fixed 20-byte header (big-endian) in
/// front of the raw MIDI payload, with an optional forwarding-context
/// extension immediately following the header when `FLAG_HAS_CONTEXT` is
/// set. Every other on-wire message (heartbeat, fragment ACK) is its own
/// small fixed-size struct with its own magic, the same way the reference
/// protocol crate keeps `MAGIC_MIDI`/`MAGIC_HEARTBEAT`/... distinct rather
/// than multiplexing everything through one envelope.
use crate::error::ProtocolError;
use crate::forwarding::ForwardingContext;

/// `b"MI"` — the only magic `MidiPacket` accepts.
pub const MAGIC_MIDI: u16 = 0x4D49;
/// `b"HB"` — heartbeat packets.
pub const MAGIC_HEARTBEAT: u16 = 0x4842;

pub const FLAG_SYSEX: u8 = 0b0000_0001;
pub const FLAG_RELIABLE: u8 = 0b0000_0010;
pub const FLAG_FRAGMENT: u8 = 0b0000_0100;
pub const FLAG_HAS_CONTEXT: u8 = 0b0000_1000;

pub const HEADER_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct MidiPacket {
    pub version: u8,
    pub flags: u8,
    pub src_node_hash: u32,
    pub dst_node_hash: u32,
    pub sequence: u16,
    pub timestamp_us: u32,
    pub device_id: u16,
    pub context: Option<ForwardingContext>,
    pub payload: Vec<u8>,
}

impl MidiPacket {
    pub fn new(src_node_hash: u32, dst_node_hash: u32, device_id: u16, payload: Vec<u8>) -> Self {
        let flags = if payload.first().copied().unwrap_or(0) >= 0xF0 {
            FLAG_SYSEX
        } else {
            0
        };
        Self {
            version: crate::PROTOCOL_VERSION,
            flags,
            src_node_hash,
            dst_node_hash,
            sequence: 0,
            timestamp_us: 0,
            device_id,
            context: None,
            payload,
        }
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&MAGIC_MIDI.to_be_bytes());
        buf.push(self.version);

        let mut flags = self.flags & !FLAG_HAS_CONTEXT;
        if self.context.is_some() {
            flags |= FLAG_HAS_CONTEXT;
        }
        buf.push(flags);

        buf.extend_from_slice(&self.src_node_hash.to_be_bytes());
        buf.extend_from_slice(&self.dst_node_hash.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.device_id.to_be_bytes());

        if let Some(ref ctx) = self.context {
            buf.extend_from_slice(&ctx.encode());
        }
        buf.extend_from_slice(&self.payload);
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                need: HEADER_SIZE,
                got: data.len(),
            });
        }
        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != MAGIC_MIDI {
            return Err(ProtocolError::BadMagic);
        }
        let version = data[2];
        let flags = data[3];
        let src_node_hash = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let dst_node_hash = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let sequence = u16::from_be_bytes([data[12], data[13]]);
        let timestamp_us = u32::from_be_bytes([data[14], data[15], data[16], data[17]]);
        let device_id = u16::from_be_bytes([data[18], data[19]]);

        let mut offset = HEADER_SIZE;
        let context = if flags & FLAG_HAS_CONTEXT != 0 {
            let ctx = ForwardingContext::decode(&data[offset..])?;
            // ext_len is the total extension size (it already counts the
            // extType/extLen octets), so an unknown ext_type still lets us
            // advance past the extension instead of misreading it as payload.
            let ext_len = data[offset + 1] as usize;
            offset += ext_len;
            ctx
        } else {
            None
        };

        let payload = data[offset..].to_vec();

        Ok(Self {
            version,
            flags,
            src_node_hash,
            dst_node_hash,
            sequence,
            timestamp_us,
            device_id,
            context,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPacket {
    pub node_hash: u32,
    pub sequence: u16,
    pub timestamp_us: u64,
}

impl HeartbeatPacket {
    pub const SIZE: usize = 16;

    pub fn serialize(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..2].copy_from_slice(&MAGIC_HEARTBEAT.to_be_bytes());
        buf[2..4].copy_from_slice(&[0, 0]); // reserved, keeps the struct 16-byte aligned
        buf[4..8].copy_from_slice(&self.node_hash.to_be_bytes());
        buf[8..10].copy_from_slice(&self.sequence.to_be_bytes());
        buf[10..16].copy_from_slice(&self.timestamp_us.to_be_bytes()[2..8]);
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        if u16::from_be_bytes([data[0], data[1]]) != MAGIC_HEARTBEAT {
            return None;
        }
        let node_hash = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let sequence = u16::from_be_bytes([data[8], data[9]]);
        let mut ts_bytes = [0u8; 8];
        ts_bytes[2..8].copy_from_slice(&data[10..16]);
        let timestamp_us = u64::from_be_bytes(ts_bytes);
        Some(Self {
            node_hash,
            sequence,
            timestamp_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midi_packet_roundtrip_no_context() {
        let packet = MidiPacket::new(0x1111_2222, 0x3333_4444, 7, vec![0x90, 60, 100]);
        let mut buf = Vec::new();
        packet.serialize(&mut buf);
        let decoded = MidiPacket::deserialize(&buf).unwrap();
        assert_eq!(decoded.src_node_hash, 0x1111_2222);
        assert_eq!(decoded.dst_node_hash, 0x3333_4444);
        assert_eq!(decoded.device_id, 7);
        assert_eq!(decoded.payload, vec![0x90, 60, 100]);
        assert!(decoded.context.is_none());
    }

    #[test]
    fn midi_packet_roundtrip_with_context() {
        let mut packet = MidiPacket::new(1, 2, 3, vec![0xF0, 0x7E, 0xF7]);
        let mut ctx = ForwardingContext::new();
        ctx.push((9, 9)).unwrap();
        packet.context = Some(ctx);
        let mut buf = Vec::new();
        packet.serialize(&mut buf);
        assert_eq!(buf[3] & FLAG_HAS_CONTEXT, FLAG_HAS_CONTEXT);
        let decoded = MidiPacket::deserialize(&buf).unwrap();
        assert_eq!(decoded.context.unwrap().hop_count, 1);
        assert_eq!(decoded.payload, vec![0xF0, 0x7E, 0xF7]);
    }

    #[test]
    fn classifies_sysex_into_flags() {
        let packet = MidiPacket::new(0, 0, 0, vec![0xF0, 0x7E, 0xF7]);
        assert_eq!(packet.flags & FLAG_SYSEX, FLAG_SYSEX);
    }

    #[test]
    fn reject_bad_magic() {
        let bad = [0xFFu8; HEADER_SIZE];
        assert!(matches!(
            MidiPacket::deserialize(&bad),
            Err(ProtocolError::BadMagic)
        ));
    }

    #[test]
    fn reject_truncated() {
        assert!(MidiPacket::deserialize(&[0u8; 4]).is_err());
    }

    #[test]
    fn heartbeat_roundtrip() {
        let hb = HeartbeatPacket {
            node_hash: 0xDEAD_BEEF,
            sequence: 42,
            timestamp_us: 123_456_789,
        };
        let mut buf = [0u8; HeartbeatPacket::SIZE];
        hb.serialize(&mut buf);
        let decoded = HeartbeatPacket::deserialize(&buf).unwrap();
        assert_eq!(decoded.node_hash, 0xDEAD_BEEF);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.timestamp_us, 123_456_789);
    }
}
