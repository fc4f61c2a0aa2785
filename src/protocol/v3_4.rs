use std::ops::RangeInclusive;

use super::{ProtocolVariant, Revision};
use crate::channels::Capabilities;
use crate::errors::{Result, SquidError};
use crate::frame::{Frame, OP_READ_REGISTER};
use crate::registers::address;

/// Revision 3.4: the presence acknowledgment carries the "Hardware"
/// capability code, and channels expose metadata registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct V3_4;

impl Revision for V3_4 {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::V3_4
    }

    fn discovery_frame(&self) -> Frame {
        Frame::new(0x00, OP_READ_REGISTER, address::HARDWARE)
    }

    fn channel_ids(&self) -> RangeInclusive<u8> {
        0x01..=0x20
    }

    fn channel_probe(&self, channel: u8) -> Frame {
        Frame::new(channel, OP_READ_REGISTER, address::HARDWARE)
    }

    fn capabilities(&self, channel: u8, payload: u16) -> Result<Capabilities> {
        Capabilities::from_hardware_code(payload)
            .ok_or(SquidError::UnrecognizedCapability {
                channel,
                code: payload,
            })
    }

    fn has_metadata(&self) -> bool {
        true
    }
}
