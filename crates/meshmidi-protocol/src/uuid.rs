/// 128-bit node identifier.
///
/// Generated once per node and persisted (see [`crate::identity`]); never
/// recomputed while the identity file exists. Not a cryptographic value —
/// collisions are possible and handled by the UUID registry's hash check.
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUuid(pub u128);

impl NodeUuid {
    /// Generate a new pseudo-random id from the current time, xor-shifted
    /// twice to spread entropy across both halves of the 128 bits.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0x9E3779B97F4A7C15);
        let mut x = nanos as u64 ^ (nanos >> 64) as u64 ^ (std::process::id() as u64) << 32;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        let mut y = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
        y ^= y << 13;
        y ^= y >> 7;
        y ^= y << 17;
        Self(((x as u128) << 64) | y as u128)
    }

    pub fn as_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    /// First four bytes of an FNV-1a digest over the UUID, used as the
    /// compact on-wire node identifier in packet headers.
    pub fn hash32(&self) -> u32 {
        let bytes = self.as_bytes();
        let mut h: u32 = 0x811C_9DC5;
        for b in bytes {
            h ^= b as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
        h
    }

    pub fn to_hex(&self) -> String {
        let b = self.as_bytes();
        b.iter().map(|x| format!("{:02x}", x)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(byte_str, 16).ok()?;
        }
        Some(Self::from_bytes(bytes))
    }
}

impl fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = NodeUuid::generate();
        let hex = id.to_hex();
        assert_eq!(NodeUuid::from_hex(&hex), Some(id));
    }

    #[test]
    fn distinct_generation() {
        let a = NodeUuid::generate();
        let b = NodeUuid::generate();
        assert_ne!(a, b, "two generated uuids collided, entropy source is broken");
    }

    #[test]
    fn hash32_stable() {
        let id = NodeUuid::generate();
        assert_eq!(id.hash32(), id.hash32());
    }
}
