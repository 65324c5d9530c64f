/// Local MIDI I/O boundary: a `MidiPort` trait covering one platform MIDI
/// input or output port, plus a platform enumerator. This crate is the
/// external-collaborator layer — the rest of the mesh only depends on this
/// trait, never on a specific platform API.
///
/// Only Linux (ALSA raw sequencer ports) is implemented, matching the
/// reference stack's `alsa` dependency. Other platforms get a stub that
/// reports `DeviceError::PlatformUnsupported` — a full cross-platform
/// backend (CoreMIDI, WinRT) is outside this repo's scope.
pub mod platform;

use meshmidi_protocol::routing::DeviceDirection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("platform MIDI backend is not available on this target")]
    PlatformUnsupported,

    #[error("no MIDI port with id {0}")]
    NotFound(u16),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub struct PortDescriptor {
    pub id: u16,
    pub name: String,
    pub direction: DeviceDirection,
}

/// One local MIDI port, opened for exclusive use by the node. `Sync` lets a
/// single opened port be shared (via `Arc`) between the router's dispatch
/// path and whichever task polls it for inbound bytes.
pub trait MidiPort: Send + Sync {
    fn id(&self) -> u16;
    fn name(&self) -> &str;
    fn direction(&self) -> DeviceDirection;

    /// Output ports only: write a raw MIDI message.
    fn send(&self, data: &[u8]) -> Result<(), DeviceError>;

    /// Input ports only: non-blocking poll for the next received message.
    fn poll_receive(&self) -> Result<Option<Vec<u8>>, DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Enumerate all local MIDI ports visible to this node.
pub fn enumerate() -> Result<Vec<PortDescriptor>, DeviceError> {
    platform::current::enumerate()
}

/// Open a local port by id for use as a `MidiPort`.
pub fn open(id: u16) -> Result<Box<dyn MidiPort>, DeviceError> {
    platform::current::open(id)
}
