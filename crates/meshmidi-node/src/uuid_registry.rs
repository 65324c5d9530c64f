/// Process-wide map from a peer's 32-bit wire hash back to its full 128-bit
/// identity. Wire packets only carry the compact hash (see
/// `meshmidi_protocol::packet`); anything that needs the canonical identity
/// (routing table keys, the connection pool) looks it up here.
use std::collections::HashMap;
use std::sync::RwLock;

use meshmidi_protocol::error::ProtocolError;
use meshmidi_protocol::uuid::NodeUuid;

#[derive(Default)]
pub struct UuidRegistry {
    inner: RwLock<HashMap<u32, NodeUuid>>,
}

impl UuidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer's identity, rejecting a hash collision against a
    /// different peer already known under the same hash.
    pub fn register(&self, uuid: NodeUuid) -> Result<(), ProtocolError> {
        let hash = uuid.hash32();
        let mut map = self.inner.write().expect("uuid registry poisoned");
        match map.get(&hash) {
            Some(existing) if *existing != uuid => Err(ProtocolError::HashCollision(hash)),
            _ => {
                map.insert(hash, uuid);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, uuid: NodeUuid) {
        let mut map = self.inner.write().expect("uuid registry poisoned");
        if map.get(&uuid.hash32()) == Some(&uuid) {
            map.remove(&uuid.hash32());
        }
    }

    pub fn lookup(&self, hash: u32) -> Option<NodeUuid> {
        self.inner.read().expect("uuid registry poisoned").get(&hash).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_roundtrips() {
        let registry = UuidRegistry::new();
        let uuid = NodeUuid::generate();
        registry.register(uuid).unwrap();
        assert_eq!(registry.lookup(uuid.hash32()), Some(uuid));
    }

    #[test]
    fn registering_same_uuid_twice_is_fine() {
        let registry = UuidRegistry::new();
        let uuid = NodeUuid::generate();
        registry.register(uuid).unwrap();
        registry.register(uuid).unwrap();
    }
}
