/// Persisted node identity: the 128-bit uuid a node presents to the mesh,
/// stable across restarts. Stored as a flat UTF-8 hex file inside the
/// node's state directory, guarded by a sibling lock file so two instances
/// never claim the same identity.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::uuid::NodeUuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub uuid: NodeUuid,
    pub name: String,
}

impl NodeIdentity {
    /// Load the identity from `<state_dir>/identity`, creating a fresh one
    /// (and the state directory, if absent) when no file exists yet.
    pub fn load_or_create(state_dir: &Path, name: &str) -> io::Result<Self> {
        fs::create_dir_all(state_dir)?;
        let identity_path = state_dir.join("identity");

        match fs::read_to_string(&identity_path) {
            Ok(contents) => {
                let hex = contents.trim();
                let uuid = NodeUuid::from_hex(hex).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("identity file at {:?} is not a valid uuid", identity_path),
                    )
                })?;
                Ok(Self {
                    uuid,
                    name: name.to_string(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let uuid = NodeUuid::generate();
                fs::write(&identity_path, uuid.to_hex())?;
                Ok(Self {
                    uuid,
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Advisory lock file held for the process lifetime, preventing a second
/// instance from starting against the same state directory. Dropped (and
/// the file removed) when the guard goes out of scope.
pub struct IdentityLock {
    path: PathBuf,
}

impl IdentityLock {
    pub fn acquire(state_dir: &Path) -> io::Result<Self> {
        let path = state_dir.join(".lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "another instance already holds the identity lock at {:?}",
                    path
                ),
            )),
            Err(e) => Err(e),
        }
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reload_is_stable() {
        let dir = std::env::temp_dir().join(format!("meshmidi-identity-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let first = NodeIdentity::load_or_create(&dir, "node-a").unwrap();
        let second = NodeIdentity::load_or_create(&dir, "node-a").unwrap();
        assert_eq!(first.uuid, second.uuid, "reloading must not regenerate the uuid");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn lock_rejects_second_holder() {
        let dir = std::env::temp_dir().join(format!("meshmidi-lock-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let _first = IdentityLock::acquire(&dir).unwrap();
        let second = IdentityLock::acquire(&dir);
        assert!(second.is_err());

        fs::remove_dir_all(&dir).ok();
    }
}
