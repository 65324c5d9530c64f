/// Splits MIDI messages onto the real-time vs. non-real-time transport. A
/// pure function over the leading status byte — no allocation, inlined on
/// the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    RealTime,
    NonRealTime,
}

#[inline]
pub fn classify(bytes: &[u8]) -> MessageClass {
    match bytes.first() {
        Some(0x80..=0xEF) => MessageClass::RealTime,
        Some(0xF8..=0xFF) => MessageClass::RealTime,
        Some(0xF0..=0xF7) => MessageClass::NonRealTime,
        // No status byte, or a byte outside the defined ranges: default to
        // the safer, ordered, retried path.
        _ => MessageClass::NonRealTime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_voice_is_realtime() {
        assert_eq!(classify(&[0x90, 60, 100]), MessageClass::RealTime);
        assert_eq!(classify(&[0xB0, 7, 127]), MessageClass::RealTime);
        assert_eq!(classify(&[0xEF, 0, 0]), MessageClass::RealTime);
    }

    #[test]
    fn system_realtime_is_realtime() {
        assert_eq!(classify(&[0xF8]), MessageClass::RealTime);
        assert_eq!(classify(&[0xFF]), MessageClass::RealTime);
    }

    #[test]
    fn sysex_is_non_realtime() {
        assert_eq!(classify(&[0xF0, 0x7E, 0xF7]), MessageClass::NonRealTime);
        assert_eq!(classify(&[0xF7]), MessageClass::NonRealTime);
    }

    #[test]
    fn empty_defaults_non_realtime() {
        assert_eq!(classify(&[]), MessageClass::NonRealTime);
    }
}
