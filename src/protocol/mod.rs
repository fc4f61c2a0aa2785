//! Protocol revisions.
//!
//! The legacy firmware and revision 3.4 share the frame format and every
//! channel command, but differ in how a device and its channels are found:
//! discovery frame, channel id range, and capability decoding. A
//! [`Revision`] captures exactly those differences and is selected once, at
//! discovery, through [`ProtocolVariant::revision`].

mod legacy;
mod v3_4;

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

pub use legacy::Legacy;
pub use v3_4::V3_4;

use crate::channels::Capabilities;
use crate::errors::{Result, SquidError};
use crate::frame::Frame;

/// Protocol revision spoken by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVariant {
    Legacy,
    V3_4,
}

impl ProtocolVariant {
    /// Probe order used when the revision is not known in advance.
    pub const ALL: [ProtocolVariant; 2] = [ProtocolVariant::V3_4, ProtocolVariant::Legacy];

    pub fn revision(self) -> &'static dyn Revision {
        match self {
            ProtocolVariant::Legacy => &Legacy,
            ProtocolVariant::V3_4 => &V3_4,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::Legacy => f.write_str("legacy"),
            ProtocolVariant::V3_4 => f.write_str("3.4"),
        }
    }
}

/// How a channel answered its presence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    /// Present; carries the payload of the acknowledgment.
    Present(u16),
}

/// Everything that differs between protocol revisions.
pub trait Revision: Send + Sync {
    fn variant(&self) -> ProtocolVariant;

    /// Frame the device echoes verbatim when it is listening at this baud.
    fn discovery_frame(&self) -> Frame;

    /// Channel ids to walk during enumeration, ascending.
    fn channel_ids(&self) -> RangeInclusive<u8>;

    fn channel_probe(&self, channel: u8) -> Frame;

    /// Resolve the capability profile of a present channel from the payload
    /// of its presence acknowledgment.
    fn capabilities(&self, channel: u8, payload: u16) -> Result<Capabilities>;

    /// Whether present channels carry firmware/date/serial registers.
    fn has_metadata(&self) -> bool;

    /// Classify a channel probe response.
    ///
    /// A verbatim echo means absent, an acknowledgment means present, and
    /// anything else is a protocol violation.
    fn classify(&self, request: Frame, response: Frame) -> Result<Presence> {
        if response == request {
            Ok(Presence::Absent)
        } else if response.is_ack_for(request.channel()) {
            Ok(Presence::Present(response.payload()))
        } else {
            Err(SquidError::EchoMismatch { request, response })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Capability;

    #[test]
    fn discovery_frames() {
        assert_eq!(
            ProtocolVariant::Legacy.revision().discovery_frame().as_bytes(),
            &[0xFF, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            ProtocolVariant::V3_4.revision().discovery_frame().as_bytes(),
            &[0x00, 0x40, 0x00, 0xF0]
        );
    }

    #[test]
    fn channel_ranges_and_probes() {
        let legacy = ProtocolVariant::Legacy.revision();
        assert_eq!(legacy.channel_ids(), 0x00..=0x40);
        assert_eq!(legacy.channel_probe(0x07).as_bytes(), &[0x07, 0x40, 0x00, 0x64]);

        let v34 = ProtocolVariant::V3_4.revision();
        assert_eq!(v34.channel_ids(), 0x01..=0x20);
        assert_eq!(v34.channel_probe(0x07).as_bytes(), &[0x07, 0x40, 0x00, 0xF0]);
    }

    #[test]
    fn classify_echo_ack_and_garbage() {
        let rev = ProtocolVariant::V3_4.revision();
        let probe = rev.channel_probe(3);
        assert_eq!(rev.classify(probe, probe).unwrap(), Presence::Absent);
        assert_eq!(
            rev.classify(probe, Frame::new(3, 0xFF, 0x0003)).unwrap(),
            Presence::Present(0x0003)
        );
        assert!(matches!(
            rev.classify(probe, Frame::new(4, 0xFF, 0x0003)),
            Err(SquidError::EchoMismatch { .. })
        ));
        assert!(matches!(
            rev.classify(probe, Frame::new(3, 0x41, 0x00F0)),
            Err(SquidError::EchoMismatch { .. })
        ));
    }

    #[test]
    fn capability_decoding_differs_by_revision() {
        let legacy = ProtocolVariant::Legacy.revision();
        let caps = legacy.capabilities(1, 0x0000).unwrap();
        assert!(caps.contains(Capability::Bias));
        assert!(!caps.contains(Capability::DetectorBias));

        let v34 = ProtocolVariant::V3_4.revision();
        assert!(!v34.capabilities(1, 0x0001).unwrap().contains(Capability::FastResetFll));
        assert!(v34.capabilities(1, 0x0003).unwrap().contains(Capability::FastResetFll));
        assert!(matches!(
            v34.capabilities(1, 0x0007),
            Err(SquidError::UnrecognizedCapability { channel: 1, code: 0x0007 })
        ));
    }
}
