//! One controller session: baseline, enumerate, initialize, operate,
//! tear down.
//!
//! A channel whose initialization sequence failed is marked unsafe and
//! refuses every operation until [`Session::reinitialize`] succeeds on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::autotune::{AutoTuneController, AutoTuneSession, TuneRequest, TuneResult};
use crate::channels::{ChannelEnumerator, ChannelInfo};
use crate::codec::ParameterKind;
use crate::config::SessionConfig;
use crate::errors::{Result, SquidError};
use crate::probe::{available_ports, DeviceProbe, DiscoveredDevice};
use crate::protocol::ProtocolVariant;
use crate::registers::{
    Ack, Command, RegisterClient, DEVICE_BASELINE, DEVICE_RELEASE, INITIALIZE, TEARDOWN,
};
use crate::sampling::{SampleBurst, SampleStreamReader};
use crate::transport::FrameTransport;

/// Whether a channel may be operated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Ready,
    /// Initialization did not complete; analog state is unknown.
    Unsafe,
}

#[derive(Debug, Clone)]
struct ChannelEntry {
    info: ChannelInfo,
    state: ChannelState,
}

/// An open controller with its enumerated channels.
///
/// # Example
/// ```ignore
/// let mut session = Session::connect(SessionConfig::default())?;
/// for info in session.channels() {
///     println!("channel {:#04x}: {:?}", info.id, info.capabilities);
/// }
/// session.set_bias(0x01, 0.75)?;
/// let burst = session.sample(0x01)?;
/// session.close()?;
/// ```
pub struct Session {
    transport: FrameTransport,
    port: String,
    baud: u32,
    variant: ProtocolVariant,
    config: SessionConfig,
    channels: BTreeMap<u8, ChannelEntry>,
    closed: bool,
}

impl Session {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Discover a controller among the host's serial ports and open it.
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let ports = available_ports(config.usb_filter)?;
        let device = DeviceProbe::new(&config).discover(&ports)?;
        Self::open(device, config)
    }

    /// Same as [`Session::connect`], probing all ports at once.
    pub fn connect_concurrently(config: SessionConfig) -> Result<Self> {
        let ports = available_ports(config.usb_filter)?;
        let probe = Arc::new(DeviceProbe::new(&config));
        let rt = tokio::runtime::Runtime::new()?;
        let device = rt.block_on(probe.discover_concurrently(ports))?;
        Self::open(device, config)
    }

    /// Open a controller on a known port; baud rate and protocol are still
    /// discovered.
    pub fn connect_port(port: &str, config: SessionConfig) -> Result<Self> {
        let device = DeviceProbe::new(&config).discover(&[port.to_string()])?;
        Self::open(device, config)
    }

    /// Bring up a discovered controller: device baseline, channel
    /// enumeration, then per-channel initialization.
    pub fn open(device: DiscoveredDevice, config: SessionConfig) -> Result<Self> {
        let DiscoveredDevice {
            port,
            baud,
            variant,
            transport,
        } = device;
        Self::with_transport(transport, port, baud, variant, config)
    }

    /// Bring up a controller over an already established transport.
    pub fn with_transport(
        mut transport: FrameTransport,
        port: String,
        baud: u32,
        variant: ProtocolVariant,
        config: SessionConfig,
    ) -> Result<Self> {
        if config.device_baseline {
            RegisterClient::new(&mut transport, config.timeouts.register)
                .broadcast(&DEVICE_BASELINE, config.broadcast_settle)?;
        }

        let enumerated = ChannelEnumerator::new(
            &mut transport,
            variant.revision(),
            config.timeouts.probe,
        )
        .enumerate();
        let found = match enumerated {
            Ok(found) => found,
            Err(e) => {
                // The baseline already went out; hand the device back before failing.
                if config.device_baseline {
                    if let Err(release) = RegisterClient::new(&mut transport, config.timeouts.register)
                        .broadcast(&DEVICE_RELEASE, config.broadcast_settle)
                    {
                        warn!("device release after failed enumeration: {}", release);
                    }
                }
                return Err(e);
            }
        };

        let mut session = Self {
            transport,
            port,
            baud,
            variant,
            config,
            channels: BTreeMap::new(),
            closed: false,
        };
        for info in found {
            let id = info.id;
            session.channels.insert(
                id,
                ChannelEntry {
                    info,
                    state: ChannelState::Unsafe,
                },
            );
            if let Err(e) = session.reinitialize(id) {
                error!("channel {:#04x} left unsafe: {}", id, e);
            }
        }
        info!(
            "session open: port={}, baud={}, protocol={}, channels={}, ready={}",
            session.port,
            session.baud,
            session.variant,
            session.channels.len(),
            session.ready_channels().len()
        );
        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Every enumerated channel in ascending id order, ready or not.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelInfo> {
        self.channels.values().map(|entry| &entry.info)
    }

    pub fn channel(&self, id: u8) -> Option<&ChannelInfo> {
        self.channels.get(&id).map(|entry| &entry.info)
    }

    pub fn channel_state(&self, id: u8) -> Option<ChannelState> {
        self.channels.get(&id).map(|entry| entry.state)
    }

    /// Ids of channels that may be operated.
    pub fn ready_channels(&self) -> Vec<u8> {
        self.channels
            .iter()
            .filter(|(_, entry)| entry.state == ChannelState::Ready)
            .map(|(id, _)| *id)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Run the initialization sequence on a channel again. Success makes an
    /// unsafe channel ready.
    pub fn reinitialize(&mut self, channel: u8) -> Result<()> {
        let capabilities = self
            .channels
            .get(&channel)
            .map(|entry| entry.info.capabilities)
            .ok_or(SquidError::ChannelUnavailable(channel))?;

        let outcome = RegisterClient::new(&mut self.transport, self.config.timeouts.register)
            .run_sequence(channel, capabilities, &INITIALIZE);
        let state = if outcome.is_ok() {
            ChannelState::Ready
        } else {
            ChannelState::Unsafe
        };
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.state = state;
        }
        debug!("channel {:#04x} initialized: {:?}", channel, state);
        outcome
    }

    /// Tear every channel down, release the device and close the port.
    ///
    /// All channels are attempted even if one fails; the first error is
    /// returned.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let timeout = self.config.timeouts.register;
        let mut first_error = None;
        let channels: Vec<_> = self
            .channels
            .values()
            .map(|entry| (entry.info.id, entry.info.capabilities))
            .collect();
        for (id, capabilities) in channels {
            if let Err(e) = RegisterClient::new(&mut self.transport, timeout)
                .run_sequence(id, capabilities, &TEARDOWN)
            {
                warn!("channel {:#04x} teardown failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        if self.config.device_baseline {
            if let Err(e) = RegisterClient::new(&mut self.transport, timeout)
                .broadcast(&DEVICE_RELEASE, self.config.broadcast_settle)
            {
                warn!("device release failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        self.channels.clear();
        info!("session closed: port={}", self.port);
        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------------
    // Channel Functions
    // ------------------------------------------------------------------------

    /// Issue any channel command on a ready channel.
    pub fn apply(&mut self, channel: u8, command: Command) -> Result<Ack> {
        let capabilities = self.ready(channel)?.capabilities;
        RegisterClient::new(&mut self.transport, self.config.timeouts.register)
            .apply(channel, capabilities, command)
    }

    /// Write an analog parameter; returns the acknowledged physical value.
    pub fn set(&mut self, channel: u8, kind: ParameterKind, value: f64) -> Result<f64> {
        let ack = self.apply(channel, Command::Set(kind, value))?;
        Ok(ack.value.unwrap_or_else(|| kind.decode(ack.code)))
    }

    pub fn set_bias(&mut self, channel: u8, value: f64) -> Result<f64> {
        self.set(channel, ParameterKind::Bias, value)
    }

    pub fn set_dc_bias(&mut self, channel: u8, value: f64) -> Result<f64> {
        self.set(channel, ParameterKind::DcBias, value)
    }

    pub fn set_offset(&mut self, channel: u8, value: f64) -> Result<f64> {
        self.set(channel, ParameterKind::Offset, value)
    }

    pub fn set_flux(&mut self, channel: u8, value: f64) -> Result<f64> {
        self.set(channel, ParameterKind::Flux, value)
    }

    /// Detector bias in µA.
    pub fn set_detector_bias(&mut self, channel: u8, micro_amps: f64) -> Result<f64> {
        self.set(channel, ParameterKind::DetectorBias, micro_amps)
    }

    /// Heat the SQUID for `millis` milliseconds.
    pub fn heat_squid(&mut self, channel: u8, millis: f64) -> Result<f64> {
        self.set(channel, ParameterKind::HeatSquid, millis)
    }

    /// Detector heater current in µA.
    pub fn heat_detector(&mut self, channel: u8, micro_amps: f64) -> Result<f64> {
        self.set(channel, ParameterKind::HeatDetector, micro_amps)
    }

    pub fn ac_flux(&mut self, channel: u8, on: bool) -> Result<()> {
        self.apply(channel, Command::AcFlux(on)).map(|_| ())
    }

    pub fn test_in(&mut self, channel: u8, on: bool) -> Result<()> {
        self.apply(channel, Command::TestIn(on)).map(|_| ())
    }

    pub fn reset_fll(&mut self, channel: u8, on: bool) -> Result<()> {
        self.apply(channel, Command::ResetFll(on)).map(|_| ())
    }

    pub fn fast_reset_fll(&mut self, channel: u8) -> Result<()> {
        self.apply(channel, Command::FastResetFll).map(|_| ())
    }

    /// Move the AC flux amplitude potentiometer by `delta` taps (clamped to
    /// ±31). Returns the acknowledged delta. A zero delta sends nothing.
    pub fn change_ac_flux_amplitude(&mut self, channel: u8, delta: i32) -> Result<i32> {
        if delta == 0 {
            self.ready(channel)?;
            return Ok(0);
        }
        let ack = self.apply(channel, Command::AcFluxAmplitude(delta))?;
        Ok(crate::codec::decode_tap_delta(ack.code))
    }

    /// Write an auto-tune parameter (heat time, waiting time, hub) at a
    /// parameter bus address. Returns the acknowledged code.
    pub fn write_bus(
        &mut self,
        channel: u8,
        address: u16,
        kind: ParameterKind,
        value: f64,
    ) -> Result<u16> {
        self.ready(channel)?;
        RegisterClient::new(&mut self.transport, self.config.timeouts.register)
            .write_bus(channel, address, kind.encode(value))
    }

    pub fn read_register(&mut self, channel: u8, subaddress: u16) -> Result<u16> {
        self.ready(channel)?;
        RegisterClient::new(&mut self.transport, self.config.timeouts.register)
            .read(channel, subaddress)
    }

    /// The unlabeled registers `0x14..=0x1A`, raw.
    pub fn read_unlabeled(&mut self, channel: u8) -> Result<[u16; 4]> {
        self.ready(channel)?;
        RegisterClient::new(&mut self.transport, self.config.timeouts.register)
            .read_unlabeled(channel)
    }

    pub fn read_modulation_amplitude(&mut self, channel: u8) -> Result<u16> {
        self.ready(channel)?;
        RegisterClient::new(&mut self.transport, self.config.timeouts.register)
            .read_modulation_amplitude(channel)
    }

    // ------------------------------------------------------------------------
    // Auto-Tune and Sampling
    // ------------------------------------------------------------------------

    /// Run a device-side auto-tune. Blocks for the configured tune time.
    pub fn auto_tune(&mut self, channel: u8, request: TuneRequest) -> Result<TuneResult> {
        let capabilities = self.ready(channel)?.capabilities;
        let mut tune = AutoTuneSession::new(channel, request);
        self.tuner().run(&mut tune, capabilities)
    }

    /// Tuned values stored by the last auto-tune, without tuning again.
    pub fn read_tuned_values(&mut self, channel: u8) -> Result<TuneResult> {
        self.ready(channel)?;
        self.tuner().read_tuned_values(channel)
    }

    /// Stored auto-tune bias range `(start, end)`.
    pub fn read_tune_range(&mut self, channel: u8) -> Result<(f64, f64)> {
        self.ready(channel)?;
        self.tuner().read_tune_range(channel)
    }

    /// Trigger and read one sample burst.
    pub fn sample(&mut self, channel: u8) -> Result<SampleBurst> {
        self.ready(channel)?;
        let timeout = self.config.timeouts.burst_for(self.baud);
        SampleStreamReader::new(&mut self.transport, timeout).sample(channel)
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn ready(&self, channel: u8) -> Result<&ChannelInfo> {
        match self.channels.get(&channel) {
            Some(entry) if entry.state == ChannelState::Ready => Ok(&entry.info),
            _ => Err(SquidError::ChannelUnavailable(channel)),
        }
    }

    fn tuner(&mut self) -> AutoTuneController<'_> {
        let timeouts = &self.config.timeouts;
        AutoTuneController::new(
            &mut self.transport,
            timeouts.register,
            timeouts.tune_minimum(),
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            debug!("session dropped without close; tearing down");
            if let Err(e) = self.shutdown() {
                warn!("teardown on drop failed: {}", e);
            }
        }
    }
}
