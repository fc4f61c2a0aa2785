use std::ops::RangeInclusive;

use log::debug;

use super::{ProtocolVariant, Revision};
use crate::channels::Capabilities;
use crate::errors::Result;
use crate::frame::{Frame, OP_READ_REGISTER};

/// Pre-3.4 firmware: every present channel has the base profile and no
/// metadata registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Legacy;

const DISCOVERY: Frame = Frame::from_bytes([0xFF, 0x00, 0x00, 0x00]);
const CHANNEL_PROBE_ADDRESS: u16 = 0x0064;

impl Revision for Legacy {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Legacy
    }

    fn discovery_frame(&self) -> Frame {
        DISCOVERY
    }

    fn channel_ids(&self) -> RangeInclusive<u8> {
        0x00..=0x40
    }

    fn channel_probe(&self, channel: u8) -> Frame {
        Frame::new(channel, OP_READ_REGISTER, CHANNEL_PROBE_ADDRESS)
    }

    fn capabilities(&self, channel: u8, payload: u16) -> Result<Capabilities> {
        if payload != 0 {
            debug!(
                "legacy channel {:#04x} acknowledged with payload {:#06x}, ignored",
                channel, payload
            );
        }
        Ok(Capabilities::BASE)
    }

    fn has_metadata(&self) -> bool {
        false
    }
}
