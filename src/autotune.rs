//! Device-side automatic SQUID tuning.
//!
//! The device searches for an operating point between a start and an end
//! bias on its own. It sends nothing while it works and cannot be polled or
//! aborted, so the controller waits a fixed minimum time after starting the
//! search before reading back the tuned bias, offset and flux.
//!
//! ```text
//! Idle -> BaselineReset -> StartBiasSet -> EndBiasPrimed -> EndBiasSet
//!      -> Tuning -> AwaitingResult -> ResultsRead -> Idle
//! ```
//! Any failed exchange moves the session to `Error`.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::channels::{Capabilities, Capability};
use crate::codec::{ParameterKind, SYMMETRIC};
use crate::errors::{Result, SquidError};
use crate::frame::{OP_PARAMETER_BUS, OP_START_TUNE};
use crate::registers::{address, Command, RegisterClient};
use crate::transport::FrameTransport;

/// Which vendor tuning procedure to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuneVariant {
    /// "Auto Tune SQUID": zeroes offset/flux and switches the loop controls
    /// off before configuring the bias range.
    Squid,
    /// "Auto Tune SQUID2": starts directly at the bias range.
    Squid2,
}

/// Extra address/value pair written on the parameter bus before tuning
/// starts (heat time, waiting time, hub).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusParameter {
    pub address: u16,
    pub kind: ParameterKind,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRequest {
    pub variant: TuneVariant,
    /// Start of the bias search range (±2.5 scale).
    pub start_bias: f64,
    /// End of the bias search range (±2.5 scale).
    pub end_bias: f64,
    #[serde(default)]
    pub extra: Vec<BusParameter>,
}

impl TuneRequest {
    pub fn new(variant: TuneVariant, start_bias: f64, end_bias: f64) -> Self {
        Self {
            variant,
            start_bias,
            end_bias,
            extra: Vec::new(),
        }
    }
}

/// Tuned operating point as read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneResult {
    pub bias_code: u16,
    pub offset_code: u16,
    pub flux_code: u16,
    pub bias: f64,
    pub offset: f64,
    pub flux: f64,
}

impl TuneResult {
    pub fn from_codes(bias_code: u16, offset_code: u16, flux_code: u16) -> Self {
        Self {
            bias_code,
            offset_code,
            flux_code,
            bias: SYMMETRIC.decode(bias_code),
            offset: SYMMETRIC.decode(offset_code),
            flux: SYMMETRIC.decode(flux_code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneState {
    Idle,
    BaselineReset,
    StartBiasSet,
    EndBiasPrimed,
    EndBiasSet,
    Tuning,
    AwaitingResult,
    ResultsRead,
    Error,
}

/// One tuning run on one channel, owned by the caller.
#[derive(Debug, Clone)]
pub struct AutoTuneSession {
    pub channel: u8,
    pub request: TuneRequest,
    pub start_bias_code: u16,
    pub end_bias_code: u16,
    state: TuneState,
    result: Option<TuneResult>,
}

impl AutoTuneSession {
    pub fn new(channel: u8, request: TuneRequest) -> Self {
        Self {
            channel,
            start_bias_code: SYMMETRIC.encode(request.start_bias),
            end_bias_code: SYMMETRIC.encode(request.end_bias),
            request,
            state: TuneState::Idle,
            result: None,
        }
    }

    pub fn state(&self) -> TuneState {
        self.state
    }

    pub fn result(&self) -> Option<&TuneResult> {
        self.result.as_ref()
    }

    fn enter(&mut self, state: TuneState) {
        debug!(
            "channel {:#04x} auto-tune: {:?} -> {:?}",
            self.channel, self.state, state
        );
        self.state = state;
    }
}

const BASELINE_RESET: [Command; 5] = [
    Command::Set(ParameterKind::Offset, 0.0),
    Command::Set(ParameterKind::Flux, 0.0),
    Command::ResetFll(false),
    Command::AcFlux(false),
    Command::TestIn(false),
];

/// Drives [`AutoTuneSession`]s over one transport.
pub struct AutoTuneController<'t> {
    registers: RegisterClient<'t>,
    minimum_wait: Duration,
}

impl<'t> AutoTuneController<'t> {
    /// `minimum_wait` is the time held between the start acknowledgment and
    /// the first result read (nominal device time plus margin).
    pub fn new(transport: &'t mut FrameTransport, timeout: Duration, minimum_wait: Duration) -> Self {
        Self {
            registers: RegisterClient::new(transport, timeout),
            minimum_wait,
        }
    }

    /// Run a complete tune. Blocks for at least `minimum_wait`.
    pub fn run(
        &mut self,
        session: &mut AutoTuneSession,
        capabilities: Capabilities,
    ) -> Result<TuneResult> {
        if session.state != TuneState::Idle {
            return Err(SquidError::InvalidArgument(format!(
                "auto-tune session is in state {:?}",
                session.state
            )));
        }
        if !capabilities.contains(Capability::Bias) {
            return Err(SquidError::UnsupportedCapability {
                channel: session.channel,
                capability: Capability::Bias,
            });
        }

        match self.drive(session, capabilities) {
            Ok(result) => {
                session.result = Some(result);
                session.enter(TuneState::Idle);
                info!(
                    "channel {:#04x} tuned: bias={:.4} offset={:.4} flux={:.4}",
                    session.channel, result.bias, result.offset, result.flux
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    "channel {:#04x} auto-tune failed in {:?}: {}",
                    session.channel, session.state, e
                );
                session.enter(TuneState::Error);
                Err(e)
            }
        }
    }

    fn drive(
        &mut self,
        session: &mut AutoTuneSession,
        capabilities: Capabilities,
    ) -> Result<TuneResult> {
        let ch = session.channel;

        if session.request.variant == TuneVariant::Squid {
            session.enter(TuneState::BaselineReset);
            for command in BASELINE_RESET {
                self.registers.apply(ch, capabilities, command)?;
            }
        }

        session.enter(TuneState::StartBiasSet);
        self.registers
            .write_bus(ch, address::START_BIAS, session.start_bias_code)?;

        session.enter(TuneState::EndBiasPrimed);
        self.registers
            .write(ch, OP_PARAMETER_BUS, address::END_BIAS)?;

        session.enter(TuneState::EndBiasSet);
        self.registers
            .write(ch, OP_PARAMETER_BUS, session.end_bias_code)?;
        for param in &session.request.extra {
            self.registers
                .write_bus(ch, param.address, param.kind.encode(param.value))?;
        }

        session.enter(TuneState::Tuning);
        self.registers.write(ch, OP_START_TUNE, 0x0000)?;
        let started = Instant::now();

        session.enter(TuneState::AwaitingResult);
        let remaining = self.minimum_wait.saturating_sub(started.elapsed());
        debug!("channel {:#04x}: waiting {:?} for tune result", ch, remaining);
        thread::sleep(remaining);

        session.enter(TuneState::ResultsRead);
        self.read_tuned_values(ch)
    }

    /// Read the tuned values stored by the last run, without tuning.
    pub fn read_tuned_values(&mut self, channel: u8) -> Result<TuneResult> {
        let bias = self.registers.read(channel, address::TUNED_BIAS)?;
        let offset = self.registers.read(channel, address::TUNED_OFFSET)?;
        let flux = self.registers.read(channel, address::TUNED_FLUX)?;
        Ok(TuneResult::from_codes(bias, offset, flux))
    }

    /// Read the stored bias search range `(start, end)`.
    pub fn read_tune_range(&mut self, channel: u8) -> Result<(f64, f64)> {
        let start = self.registers.read(channel, address::START_BIAS)?;
        let end = self.registers.read(channel, address::END_BIAS)?;
        Ok((SYMMETRIC.decode(start), SYMMETRIC.decode(end)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::transport::mock::ScriptedLink;

    const TIMEOUT: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_millis(120);

    fn script_results(link: &ScriptedLink, ch: u8) {
        link.expect(Frame::new(ch, 0x40, 0x04), Frame::new(ch, 0xFF, 0x9CAB));
        link.expect(Frame::new(ch, 0x40, 0x06), Frame::new(ch, 0xFF, 0x6FD7));
        link.expect(Frame::new(ch, 0x40, 0x08), Frame::new(ch, 0xFF, 0x2BC0));
    }

    #[test]
    fn squid_variant_full_sequence() {
        let ch = 0x03;
        let link = ScriptedLink::new();
        for _ in 0..5 {
            link.ack_any();
        }
        link.expect_ack(Frame::new(ch, 0x48, 0x0000));
        link.expect_ack(Frame::new(ch, 0x48, SYMMETRIC.encode(-1.0)));
        link.expect_ack(Frame::new(ch, 0x48, 0x0002));
        link.expect_ack(Frame::new(ch, 0x48, SYMMETRIC.encode(1.0)));
        link.expect_ack(Frame::new(ch, 0x38, 0x0000));
        script_results(&link, ch);
        let mut transport = FrameTransport::new(link.clone());

        let mut session = AutoTuneSession::new(ch, TuneRequest::new(TuneVariant::Squid, -1.0, 1.0));
        let result = AutoTuneController::new(&mut transport, TIMEOUT, WAIT)
            .run(&mut session, Capabilities::BASE)
            .unwrap();

        assert_eq!(result.bias_code, 0x9CAB);
        assert_eq!(result.offset_code, 0x6FD7);
        assert_eq!(result.flux_code, 0x2BC0);
        assert_eq!(result.bias, SYMMETRIC.decode(0x9CAB));
        assert_eq!(result.offset, SYMMETRIC.decode(0x6FD7));
        assert_eq!(result.flux, SYMMETRIC.decode(0x2BC0));
        assert_eq!(session.state(), TuneState::Idle);
        assert_eq!(session.result(), Some(&result));
        assert!(link.unexpected().is_empty());

        let sent = link.sent();
        assert_eq!(sent.len(), 5 + 4 + 1 + 3);
        assert_eq!(sent[0], Frame::new(ch, 0x0B, 0x8000));
        assert_eq!(sent[1], Frame::new(ch, 0x0C, 0x8000));
        assert_eq!(sent[2], Frame::new(ch, 0x20, 0x0000));
        assert_eq!(sent[3], Frame::new(ch, 0x29, 0x0000));
        assert_eq!(sent[4], Frame::new(ch, 0x50, 0x0000));
    }

    #[test]
    fn results_not_read_before_minimum_wait() {
        let ch = 0x01;
        let link = ScriptedLink::new();
        for _ in 0..5 {
            link.ack_any();
        }
        script_results(&link, ch);
        let mut transport = FrameTransport::new(link.clone());

        let mut session =
            AutoTuneSession::new(ch, TuneRequest::new(TuneVariant::Squid2, -0.5, 0.5));
        AutoTuneController::new(&mut transport, TIMEOUT, WAIT)
            .run(&mut session, Capabilities::BASE)
            .unwrap();

        let sent = link.sent_at();
        assert_eq!(sent.len(), 8);
        let (tune_at, tune) = sent[4];
        assert_eq!(tune, Frame::new(ch, 0x38, 0x0000));
        let (read_at, read) = sent[5];
        assert_eq!(read, Frame::new(ch, 0x40, 0x0004));
        assert!(read_at.duration_since(tune_at) >= WAIT);
    }

    #[test]
    fn squid2_skips_baseline_and_writes_extra_parameters() {
        let ch = 0x02;
        let link = ScriptedLink::new();
        for _ in 0..(4 + 2 + 1) {
            link.ack_any();
        }
        script_results(&link, ch);
        let mut transport = FrameTransport::new(link.clone());

        let mut request = TuneRequest::new(TuneVariant::Squid2, 0.0, 2.0);
        request.extra.push(BusParameter {
            address: 0x0C,
            kind: ParameterKind::HeatTime,
            value: 5.0,
        });
        let mut session = AutoTuneSession::new(ch, request);
        AutoTuneController::new(&mut transport, TIMEOUT, Duration::ZERO)
            .run(&mut session, Capabilities::BASE)
            .unwrap();

        let sent = link.sent();
        assert_eq!(sent[0], Frame::new(ch, 0x48, 0x0000));
        assert_eq!(sent[1], Frame::new(ch, 0x48, 0x8000));
        assert_eq!(sent[4], Frame::new(ch, 0x48, 0x000C));
        assert_eq!(sent[5], Frame::new(ch, 0x48, 0x0005));
        assert_eq!(sent[6], Frame::new(ch, 0x38, 0x0000));
    }

    #[test]
    fn echo_mismatch_moves_to_error() {
        let ch = 0x04;
        let link = ScriptedLink::new();
        let marker = Frame::new(ch, 0x48, 0x0000);
        link.expect(marker, marker);
        let mut transport = FrameTransport::new(link.clone());

        let mut session =
            AutoTuneSession::new(ch, TuneRequest::new(TuneVariant::Squid2, -1.0, 1.0));
        let err = AutoTuneController::new(&mut transport, TIMEOUT, WAIT)
            .run(&mut session, Capabilities::BASE)
            .unwrap_err();
        assert!(matches!(err, SquidError::EchoMismatch { .. }));
        assert_eq!(session.state(), TuneState::Error);
        assert!(session.result().is_none());
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn channel_without_bias_is_rejected_before_sending() {
        let link = ScriptedLink::new();
        let mut transport = FrameTransport::new(link.clone());
        let mut session =
            AutoTuneSession::new(0x05, TuneRequest::new(TuneVariant::Squid, -1.0, 1.0));
        let err = AutoTuneController::new(&mut transport, TIMEOUT, WAIT)
            .run(&mut session, Capabilities::EMPTY)
            .unwrap_err();
        assert!(matches!(err, SquidError::UnsupportedCapability { .. }));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn tune_range_read_back() {
        let link = ScriptedLink::new();
        link.expect(Frame::new(0x01, 0x40, 0x00), Frame::new(0x01, 0xFF, 0x4CCD));
        link.expect(Frame::new(0x01, 0x40, 0x02), Frame::new(0x01, 0xFF, 0xB333));
        let mut transport = FrameTransport::new(link);

        let (start, end) = AutoTuneController::new(&mut transport, TIMEOUT, WAIT)
            .read_tune_range(0x01)
            .unwrap();
        assert!((start + 1.0).abs() <= SYMMETRIC.resolution());
        assert!((end - 1.0).abs() <= SYMMETRIC.resolution());
    }
}
