/// Per-packet forwarding context: the hop count and visited-device set a
/// packet accumulates as it crosses the mesh, used by the router to reject
/// loops and runaway forwarding depth.
///
/// The context is carried as an opt-in wire extension (see `packet`'s
/// `FLAG_HAS_CONTEXT`). A node that does not understand `ext_type` MUST
/// ignore the extension rather than reject the packet — absence of a known
/// context is always treated as "start fresh".
use crate::error::ProtocolError;
use crate::MAX_HOPS;

pub const EXT_TYPE_FORWARDING: u8 = 0x01;

/// Visited-device entries are carried on the wire as (node_hash, device_id)
/// pairs — the compact 32-bit hash from `NodeUuid::hash32`, not the full
/// 128-bit uuid, to keep the extension small.
pub type WireDeviceKey = (u32, u16);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingContext {
    pub hop_count: u8,
    pub visited: Vec<WireDeviceKey>,
}

impl ForwardingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: WireDeviceKey) -> bool {
        self.visited.contains(&key)
    }

    pub fn is_at_hop_limit(&self) -> bool {
        self.hop_count >= MAX_HOPS
    }

    /// Append the current node/device to the context before forwarding.
    /// Returns an error if this would exceed `MAX_HOPS` — callers must check
    /// `is_at_hop_limit` *before* forwarding, this is a defensive recheck.
    pub fn push(&mut self, key: WireDeviceKey) -> Result<(), ProtocolError> {
        if self.hop_count >= MAX_HOPS {
            return Err(ProtocolError::BadContext);
        }
        self.visited.push(key);
        self.hop_count += 1;
        Ok(())
    }

    /// Encode as the wire extension: extType, extLen, hopCount, devCount,
    /// then devCount * (nodeHash:u32, deviceId:u16). `extLen` is the total
    /// size of the extension in bytes, including the extType/extLen octets
    /// themselves.
    pub fn encode(&self) -> Vec<u8> {
        let dev_count = self.visited.len() as u8;
        let ext_len = 4 + 6 * dev_count;
        let mut buf = Vec::with_capacity(ext_len as usize);
        buf.push(EXT_TYPE_FORWARDING);
        buf.push(ext_len);
        buf.push(self.hop_count);
        buf.push(dev_count);
        for (hash, id) in &self.visited {
            buf.extend_from_slice(&hash.to_be_bytes());
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf
    }

    /// Decode an extension blob (starting at `ext_type`). Returns `Ok(None)`
    /// for an unknown `ext_type` — the caller should treat the packet as
    /// having no context rather than rejecting it.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::Truncated {
                need: 2,
                got: data.len(),
            });
        }
        let ext_type = data[0];
        let ext_len = data[1] as usize;
        if data.len() < ext_len {
            return Err(ProtocolError::Truncated {
                need: ext_len,
                got: data.len(),
            });
        }
        if ext_type != EXT_TYPE_FORWARDING {
            return Ok(None);
        }
        if ext_len < 4 {
            return Err(ProtocolError::BadContext);
        }
        let hop_count = data[2];
        let dev_count = data[3] as usize;
        if ext_len != 4 + dev_count * 6 {
            return Err(ProtocolError::BadContext);
        }
        let mut visited = Vec::with_capacity(dev_count);
        let mut offset = 4;
        for _ in 0..dev_count {
            let hash = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]);
            let id = u16::from_be_bytes([data[offset + 4], data[offset + 5]]);
            visited.push((hash, id));
            offset += 6;
        }
        Ok(Some(Self { hop_count, visited }))
    }

    /// Total size in bytes of this context once encoded, including the
    /// 2-byte ext_type/ext_len prefix.
    pub fn encoded_len(&self) -> usize {
        4 + self.visited.len() * 6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_empty() {
        let ctx = ForwardingContext::new();
        let encoded = ctx.encode();
        let decoded = ForwardingContext::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn roundtrip_with_hops() {
        let mut ctx = ForwardingContext::new();
        ctx.push((0x1111_2222, 4)).unwrap();
        ctx.push((0x3333_4444, 7)).unwrap();
        let encoded = ctx.encode();
        let decoded = ForwardingContext::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.hop_count, 2);
        assert_eq!(decoded.visited, vec![(0x1111_2222, 4), (0x3333_4444, 7)]);
    }

    #[test]
    fn max_hops_rejected() {
        let mut ctx = ForwardingContext::new();
        for i in 0..MAX_HOPS {
            ctx.push((i as u32, i as u16)).unwrap();
        }
        assert!(ctx.is_at_hop_limit());
        assert!(ctx.push((99, 99)).is_err());
    }

    #[test]
    fn unknown_ext_type_ignored() {
        let blob = [0xFF, 0x02, 0x00, 0x00];
        assert_eq!(ForwardingContext::decode(&blob).unwrap(), None);
    }

    #[test]
    fn encoded_len_matches_actual() {
        let mut ctx = ForwardingContext::new();
        ctx.push((1, 2)).unwrap();
        assert_eq!(ctx.encoded_len(), ctx.encode().len());
    }
}
