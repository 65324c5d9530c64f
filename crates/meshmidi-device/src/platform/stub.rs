/// Stub backend for platforms without an ALSA-equivalent implementation
/// here. Always reports no ports and refuses to open one.
use crate::{DeviceError, MidiPort, PortDescriptor};

pub fn enumerate() -> Result<Vec<PortDescriptor>, DeviceError> {
    Ok(Vec::new())
}

pub fn open(_id: u16) -> Result<Box<dyn MidiPort>, DeviceError> {
    Err(DeviceError::PlatformUnsupported)
}
