//! Channel discovery and capability profiles.

use std::fmt;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::protocol::{Presence, Revision};
use crate::registers::{address, RegisterClient};
use crate::transport::FrameTransport;

// ============================================================================
// Capabilities
// ============================================================================

/// One analog control a channel may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Bias,
    Offset,
    Flux,
    HeatSquid,
    DetectorBias,
    HeatDetector,
    FastResetFll,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Bias,
        Capability::Offset,
        Capability::Flux,
        Capability::HeatSquid,
        Capability::DetectorBias,
        Capability::HeatDetector,
        Capability::FastResetFll,
    ];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of [`Capability`] values a channel supports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const EMPTY: Capabilities = Capabilities(0);

    /// SQUID-only channel: hardware code `0x0001`, and every legacy channel.
    pub const BASE: Capabilities = Capabilities(
        Capability::Bias.bit()
            | Capability::Offset.bit()
            | Capability::Flux.bit()
            | Capability::HeatSquid.bit(),
    );

    /// SQUID plus detector channel: hardware code `0x0003`.
    pub const WITH_DETECTOR: Capabilities = Capabilities(
        Capabilities::BASE.0
            | Capability::DetectorBias.bit()
            | Capability::HeatDetector.bit()
            | Capability::FastResetFll.bit(),
    );

    /// Decode a revision 3.4 "Hardware" register value.
    pub fn from_hardware_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::BASE),
            0x0003 => Some(Self::WITH_DETECTOR),
            _ => None,
        }
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ============================================================================
// Channel Information
// ============================================================================

/// Auxiliary registers of a revision 3.4 channel, passed through unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub firmware_id: u16,
    /// Raw halves of the creation date register pair (`0xF4`, `0xF6`).
    /// No calendar decoding is applied.
    pub creation_date: (u16, u16),
    /// Always zero on known devices.
    pub reserved: u16,
    pub serial_number: u16,
}

impl ChannelMetadata {
    /// Both creation date halves as one big-endian word.
    pub fn creation_date_raw(&self) -> u32 {
        ((self.creation_date.0 as u32) << 16) | self.creation_date.1 as u32
    }
}

/// A present channel, as discovered once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: u8,
    pub capabilities: Capabilities,
    pub metadata: Option<ChannelMetadata>,
}

// ============================================================================
// Enumerator
// ============================================================================

/// Walks the channel id space of one device.
pub struct ChannelEnumerator<'t> {
    transport: &'t mut FrameTransport,
    revision: &'static dyn Revision,
    timeout: Duration,
}

impl<'t> ChannelEnumerator<'t> {
    pub fn new(
        transport: &'t mut FrameTransport,
        revision: &'static dyn Revision,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            revision,
            timeout,
        }
    }

    /// Probe every channel id of the revision, returning present channels in
    /// ascending id order.
    pub fn enumerate(&mut self) -> Result<Vec<ChannelInfo>> {
        let mut channels = Vec::new();
        for id in self.revision.channel_ids() {
            if let Some(info) = self.probe(id)? {
                channels.push(info);
            }
        }
        info!(
            "found {} channel(s) ({} protocol): {:02X?}",
            channels.len(),
            self.revision.variant(),
            channels.iter().map(|c| c.id).collect::<Vec<_>>()
        );
        Ok(channels)
    }

    /// Probe a single channel id.
    pub fn probe(&mut self, id: u8) -> Result<Option<ChannelInfo>> {
        let request = self.revision.channel_probe(id);
        let response = self.transport.exchange(request, self.timeout)?;
        let payload = match self.revision.classify(request, response)? {
            Presence::Absent => return Ok(None),
            Presence::Present(payload) => payload,
        };

        let capabilities = self.revision.capabilities(id, payload)?;
        let metadata = if self.revision.has_metadata() {
            Some(self.read_metadata(id)?)
        } else {
            None
        };
        debug!(
            "channel {:#04x} present: capabilities={:?}, metadata={:?}",
            id, capabilities, metadata
        );
        Ok(Some(ChannelInfo {
            id,
            capabilities,
            metadata,
        }))
    }

    fn read_metadata(&mut self, id: u8) -> Result<ChannelMetadata> {
        let mut registers = RegisterClient::new(self.transport, self.timeout);
        Ok(ChannelMetadata {
            firmware_id: registers.read(id, address::FIRMWARE)?,
            creation_date: (
                registers.read(id, address::CREATION_DATE_HIGH)?,
                registers.read(id, address::CREATION_DATE_LOW)?,
            ),
            reserved: registers.read(id, address::RESERVED)?,
            serial_number: registers.read(id, address::SERIAL_NUMBER)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SquidError;
    use crate::frame::Frame;
    use crate::protocol::ProtocolVariant;
    use crate::transport::mock::ScriptedLink;

    const TIMEOUT: Duration = Duration::from_millis(30);

    fn script_v34(link: &ScriptedLink, present: &[(u8, u16)]) {
        for id in 0x01..=0x20u8 {
            let probe = Frame::new(id, 0x40, 0x00F0);
            match present.iter().find(|(p, _)| *p == id) {
                Some((_, code)) => {
                    link.expect(probe, Frame::new(id, 0xFF, *code));
                    for (sub, value) in [
                        (0xF2u16, 0x0102u16),
                        (0xF4, 0x0134),
                        (0xF6, 0x89FE),
                        (0xF8, 0x0000),
                        (0xFA, 0x0040 + id as u16),
                    ] {
                        link.expect(Frame::new(id, 0x40, sub), Frame::new(id, 0xFF, value));
                    }
                }
                None => {
                    link.expect(probe, probe);
                }
            }
        }
    }

    #[test]
    fn capability_sets() {
        let base = Capabilities::from_hardware_code(0x0001).unwrap();
        assert_eq!(
            base.iter().collect::<Vec<_>>(),
            vec![
                Capability::Bias,
                Capability::Offset,
                Capability::Flux,
                Capability::HeatSquid
            ]
        );
        let full = Capabilities::from_hardware_code(0x0003).unwrap();
        assert!(full.contains(Capability::DetectorBias));
        assert!(full.contains(Capability::HeatDetector));
        assert!(full.contains(Capability::FastResetFll));
        assert_eq!(full.iter().count(), 7);
        assert!(Capabilities::from_hardware_code(0x0002).is_none());
        assert_eq!(
            Capabilities::EMPTY.with(Capability::Flux).iter().collect::<Vec<_>>(),
            vec![Capability::Flux]
        );
    }

    #[test]
    fn enumerates_exact_subset_in_ascending_order() {
        let link = ScriptedLink::new();
        script_v34(&link, &[(0x02, 0x0001), (0x05, 0x0003), (0x1F, 0x0001)]);
        let mut transport = FrameTransport::new(link.clone());

        let channels = ChannelEnumerator::new(
            &mut transport,
            ProtocolVariant::V3_4.revision(),
            TIMEOUT,
        )
        .enumerate()
        .unwrap();

        assert_eq!(
            channels.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![0x02, 0x05, 0x1F]
        );
        assert_eq!(channels[0].capabilities, Capabilities::BASE);
        assert_eq!(channels[1].capabilities, Capabilities::WITH_DETECTOR);

        let meta = channels[1].metadata.unwrap();
        assert_eq!(meta.firmware_id, 0x0102);
        assert_eq!(meta.creation_date, (0x0134, 0x89FE));
        assert_eq!(meta.creation_date_raw(), 0x0134_89FE);
        assert_eq!(meta.reserved, 0);
        assert_eq!(meta.serial_number, 0x0045);
        assert!(link.unexpected().is_empty());
        assert_eq!(link.remaining(), 0);
    }

    #[test]
    fn legacy_channels_have_fixed_profile_and_no_metadata() {
        let link = ScriptedLink::new();
        for id in 0x00..=0x40u8 {
            let probe = Frame::new(id, 0x40, 0x0064);
            if id == 0x00 || id == 0x40 {
                link.expect(probe, Frame::new(id, 0xFF, 0x0000));
            } else {
                link.expect(probe, probe);
            }
        }
        let mut transport = FrameTransport::new(link.clone());

        let channels = ChannelEnumerator::new(
            &mut transport,
            ProtocolVariant::Legacy.revision(),
            TIMEOUT,
        )
        .enumerate()
        .unwrap();

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].id, 0x00);
        assert_eq!(channels[1].id, 0x40);
        assert!(channels.iter().all(|c| c.capabilities == Capabilities::BASE));
        assert!(channels.iter().all(|c| c.metadata.is_none()));
        assert_eq!(link.remaining(), 0);
    }

    #[test]
    fn unrecognized_hardware_code_is_surfaced() {
        let link = ScriptedLink::new();
        let probe = Frame::new(0x01, 0x40, 0x00F0);
        link.expect(probe, Frame::new(0x01, 0xFF, 0x0010));
        let mut transport = FrameTransport::new(link);

        let err = ChannelEnumerator::new(
            &mut transport,
            ProtocolVariant::V3_4.revision(),
            TIMEOUT,
        )
        .probe(0x01)
        .unwrap_err();
        assert!(matches!(
            err,
            SquidError::UnrecognizedCapability {
                channel: 0x01,
                code: 0x0010
            }
        ));
    }

    #[test]
    fn corrupted_probe_response_is_echo_mismatch() {
        let link = ScriptedLink::new();
        let probe = Frame::new(0x03, 0x40, 0x00F0);
        link.expect(probe, Frame::new(0x03, 0x40, 0x00F1));
        let mut transport = FrameTransport::new(link);

        let err = ChannelEnumerator::new(
            &mut transport,
            ProtocolVariant::V3_4.revision(),
            TIMEOUT,
        )
        .probe(0x03)
        .unwrap_err();
        assert!(matches!(err, SquidError::EchoMismatch { .. }));
    }
}
