//! Per-channel command/acknowledge exchange.
//!
//! Every channel function is one request frame `<ch> <opcode> <code>` that
//! the device acknowledges with `<ch> FF <code'>`. The acknowledged code is
//! what the device actually applied and may differ from the request.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::channels::{Capabilities, Capability};
use crate::codec::{self, ParameterKind, STARTUP_TAP_DELTA};
use crate::errors::{Result, SquidError};
use crate::frame::{
    Frame, BROADCAST, OP_AC_FLUX, OP_BIAS, OP_DC_BIAS, OP_DETECTOR_BIAS, OP_FAST_RESET_FLL,
    OP_OFFSET, OP_PARAMETER_BUS, OP_READ_REGISTER, OP_RESET_FLL_OFF, OP_RESET_FLL_ON,
    OP_TEST_IN, OP_ZEROS,
};
use crate::transport::FrameTransport;

/// Nonvolatile register and parameter bus sub-addresses.
pub mod address {
    pub const START_BIAS: u16 = 0x00;
    pub const END_BIAS: u16 = 0x02;
    pub const TUNED_BIAS: u16 = 0x04;
    pub const TUNED_OFFSET: u16 = 0x06;
    pub const TUNED_FLUX: u16 = 0x08;
    pub const MODULATION_AMPLITUDE: u16 = 0x0A;
    /// Read by the vendor sequence without a documented meaning.
    pub const UNLABELED: [u16; 4] = [0x14, 0x16, 0x18, 0x1A];
    pub const HARDWARE: u16 = 0xF0;
    pub const FIRMWARE: u16 = 0xF2;
    pub const CREATION_DATE_HIGH: u16 = 0xF4;
    pub const CREATION_DATE_LOW: u16 = 0xF6;
    pub const RESERVED: u16 = 0xF8;
    pub const SERIAL_NUMBER: u16 = 0xFA;
}

// ============================================================================
// Commands
// ============================================================================

/// A channel function, before encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Write an analog parameter in physical units. Parameter bus kinds
    /// (heat time, waiting time, hub) are not accepted here; see
    /// [`RegisterClient::write_bus`].
    Set(ParameterKind, f64),
    /// Relative AC flux amplitude change, in potentiometer taps.
    AcFluxAmplitude(i32),
    AcFlux(bool),
    TestIn(bool),
    ResetFll(bool),
    FastResetFll,
}

impl Command {
    /// Capability a channel must report before this command is sent.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Command::Set(kind, _) => match kind {
                ParameterKind::Bias | ParameterKind::DcBias => Some(Capability::Bias),
                ParameterKind::Offset => Some(Capability::Offset),
                ParameterKind::Flux => Some(Capability::Flux),
                ParameterKind::DetectorBias => Some(Capability::DetectorBias),
                ParameterKind::HeatSquid => Some(Capability::HeatSquid),
                ParameterKind::HeatDetector => Some(Capability::HeatDetector),
                _ => None,
            },
            Command::FastResetFll => Some(Capability::FastResetFll),
            _ => None,
        }
    }

    /// Opcode and payload code on the wire.
    pub fn encode(&self) -> Result<(u8, u16)> {
        let switch = |on: bool| if on { 0x0001 } else { 0x0000 };
        Ok(match *self {
            Command::Set(kind, value) => {
                if kind.opcode() == OP_PARAMETER_BUS {
                    return Err(SquidError::InvalidArgument(format!(
                        "{kind:?} is written through the parameter bus"
                    )));
                }
                (kind.opcode(), kind.encode(value))
            }
            Command::AcFluxAmplitude(delta) => (
                ParameterKind::AcFluxAmplitude.opcode(),
                codec::encode_tap_delta(delta),
            ),
            Command::AcFlux(on) => (OP_AC_FLUX, switch(on)),
            Command::TestIn(on) => (OP_TEST_IN, switch(on)),
            Command::ResetFll(true) => (OP_RESET_FLL_ON, 0x0000),
            Command::ResetFll(false) => (OP_RESET_FLL_OFF, 0x0000),
            Command::FastResetFll => (OP_FAST_RESET_FLL, 0x0000),
        })
    }

    /// Physical reading of an acknowledged code, for parameter commands.
    pub fn decode_ack(&self, code: u16) -> Option<f64> {
        match self {
            Command::Set(kind, _) => Some(kind.decode(code)),
            Command::AcFluxAmplitude(_) => Some(codec::decode_tap_delta(code) as f64),
            _ => None,
        }
    }
}

/// The device's answer to a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ack {
    /// Raw acknowledged code.
    pub code: u16,
    /// Acknowledged code in physical units, for parameter commands.
    pub value: Option<f64>,
}

// ============================================================================
// Sequences
// ============================================================================

/// One named step of an initialization or teardown sequence.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub name: &'static str,
    pub command: Command,
}

const fn step(name: &'static str, command: Command) -> Step {
    Step { name, command }
}

/// Safe starting state, applied once per channel before operation.
pub const INITIALIZE: [Step; 9] = [
    step("detector bias", Command::Set(ParameterKind::DetectorBias, 0.0)),
    step("dc bias", Command::Set(ParameterKind::DcBias, 0.0)),
    step("offset", Command::Set(ParameterKind::Offset, 0.0)),
    step("flux", Command::Set(ParameterKind::Flux, 0.0)),
    step("reset fll on", Command::ResetFll(true)),
    step(
        "ac flux amplitude",
        Command::AcFluxAmplitude(STARTUP_TAP_DELTA),
    ),
    step("ac flux off", Command::AcFlux(false)),
    step("test in off", Command::TestIn(false)),
    step("bias", Command::Set(ParameterKind::Bias, 0.0)),
];

/// Safe resting state, applied once per channel before the port closes.
pub const TEARDOWN: [Step; 8] = [
    step("detector bias", Command::Set(ParameterKind::DetectorBias, 0.0)),
    step("dc bias", Command::Set(ParameterKind::DcBias, 0.0)),
    step("bias", Command::Set(ParameterKind::Bias, 0.0)),
    step("offset", Command::Set(ParameterKind::Offset, 0.0)),
    step("flux", Command::Set(ParameterKind::Flux, 0.0)),
    step("reset fll on", Command::ResetFll(true)),
    step("ac flux off", Command::AcFlux(false)),
    step("test in off", Command::TestIn(false)),
];

/// Device-wide "detector bias, bias, offset to minimum", each followed by a
/// zeros frame. Sent when a session opens.
pub const DEVICE_BASELINE: [Frame; 6] = [
    Frame::new(BROADCAST, OP_DETECTOR_BIAS, 0x0000),
    Frame::new(BROADCAST, OP_ZEROS, 0x0000),
    Frame::new(BROADCAST, OP_BIAS, 0x0000),
    Frame::new(BROADCAST, OP_ZEROS, 0x0000),
    Frame::new(BROADCAST, OP_OFFSET, 0x0000),
    Frame::new(BROADCAST, OP_ZEROS, 0x0000),
];

/// Device-wide "dc bias to minimum" plus zeros frame. Sent when a session
/// closes.
pub const DEVICE_RELEASE: [Frame; 2] = [
    Frame::new(BROADCAST, OP_DC_BIAS, 0x0000),
    Frame::new(BROADCAST, OP_ZEROS, 0x0000),
];

// ============================================================================
// Register Client
// ============================================================================

/// Generic opcode/value exchange with acknowledgment validation.
pub struct RegisterClient<'t> {
    transport: &'t mut FrameTransport,
    timeout: Duration,
}

impl<'t> RegisterClient<'t> {
    pub fn new(transport: &'t mut FrameTransport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Send `<ch> <opcode> <code>` and return the acknowledged code.
    ///
    /// Anything but `<ch> FF ....` in response is an `EchoMismatch`.
    pub fn write(&mut self, channel: u8, opcode: u8, code: u16) -> Result<u16> {
        let request = Frame::new(channel, opcode, code);
        let response = self.transport.exchange(request, self.timeout)?;
        if !response.is_ack_for(channel) {
            return Err(SquidError::EchoMismatch { request, response });
        }
        if response.payload() != code {
            debug!(
                "channel {:#04x} acknowledged {:#06x} for requested {:#06x}",
                channel,
                response.payload(),
                code
            );
        }
        Ok(response.payload())
    }

    /// Read a nonvolatile register.
    pub fn read(&mut self, channel: u8, subaddress: u16) -> Result<u16> {
        self.write(channel, OP_READ_REGISTER, subaddress)
    }

    /// Issue a channel function, rejecting it before any frame is sent if the
    /// channel lacks the required capability.
    pub fn apply(
        &mut self,
        channel: u8,
        capabilities: Capabilities,
        command: Command,
    ) -> Result<Ack> {
        if let Some(capability) = command.required_capability() {
            if !capabilities.contains(capability) {
                return Err(SquidError::UnsupportedCapability {
                    channel,
                    capability,
                });
            }
        }
        let (opcode, code) = command.encode()?;
        let code = self.write(channel, opcode, code)?;
        Ok(Ack {
            code,
            value: command.decode_ack(code),
        })
    }

    /// Address-then-value write on the parameter bus.
    pub fn write_bus(&mut self, channel: u8, address: u16, code: u16) -> Result<u16> {
        self.write(channel, OP_PARAMETER_BUS, address)?;
        self.write(channel, OP_PARAMETER_BUS, code)
    }

    /// Run a step sequence, verifying each acknowledgment before the next.
    ///
    /// Steps whose capability the channel lacks are skipped. The first
    /// failure aborts the rest of the sequence.
    pub fn run_sequence(
        &mut self,
        channel: u8,
        capabilities: Capabilities,
        steps: &[Step],
    ) -> Result<()> {
        for step in steps {
            if let Some(capability) = step.command.required_capability() {
                if !capabilities.contains(capability) {
                    debug!(
                        "channel {:#04x}: skipping '{}' (no {:?})",
                        channel, step.name, capability
                    );
                    continue;
                }
            }
            self.apply(channel, capabilities, step.command)
                .map_err(|source| SquidError::InitializationFailed {
                    channel,
                    step: step.name,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    /// Send device-wide broadcast frames.
    ///
    /// Each zeros frame is preceded by `settle`. Responses are only logged;
    /// the device does not reliably answer broadcasts.
    pub fn broadcast(&mut self, frames: &[Frame], settle: Duration) -> Result<()> {
        for &frame in frames {
            if frame.opcode() == OP_ZEROS && !settle.is_zero() {
                thread::sleep(settle);
            }
            match self.transport.exchange(frame, self.timeout) {
                Ok(response) => debug!("broadcast {} answered {}", frame, response),
                Err(e) if e.is_timeout() => debug!("broadcast {} unanswered", frame),
                Err(e) => return Err(e),
            }
        }
        info!("sent {} broadcast frame(s)", frames.len());
        Ok(())
    }

    /// Read the unlabeled registers as opaque raw values.
    pub fn read_unlabeled(&mut self, channel: u8) -> Result<[u16; 4]> {
        let mut values = [0u16; 4];
        for (slot, sub) in values.iter_mut().zip(address::UNLABELED) {
            *slot = self.read(channel, sub)?;
        }
        Ok(values)
    }

    /// Raw AC flux modulation amplitude register.
    pub fn read_modulation_amplitude(&mut self, channel: u8) -> Result<u16> {
        self.read(channel, address::MODULATION_AMPLITUDE)
    }
}
