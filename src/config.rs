//! Session configuration.
//!
//! Plain serde structs with defaults; a host application loads them from
//! whatever format it already uses.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolVariant;
use crate::sampling::BURST_LEN;

/// Baud rates tried during discovery, fastest first.
pub const BAUD_RATES: [u32; 4] = [57600, 9600, 38400, 19200];

/// USB vendor/product id of the FTDI bridge fitted to the controller.
pub const FTDI_VID: u16 = 0x0403;
pub const FTDI_PID: u16 = 0x6001;

const PROBE_TIMEOUT_MS: u64 = 200;
const REGISTER_TIMEOUT_MS: u64 = 500;
/// Device-side auto-tune duration.
const TUNE_WAIT_MS: u64 = 6200;
const TUNE_MARGIN_MS: u64 = 300;
const BURST_SLACK_MS: u64 = 250;
const BROADCAST_SETTLE_MS: u64 = 2000;
/// Bits per byte on an 8N1 line (start + 8 data + stop).
const BITS_PER_BYTE: u64 = 10;

/// Timeouts per operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Discovery probe and channel probe.
    pub probe: Duration,
    /// Any single register write/read.
    pub register: Duration,
    /// Nominal auto-tune computation time on the device.
    pub tune_wait: Duration,
    /// Extra time waited on top of `tune_wait`.
    pub tune_margin: Duration,
    /// Whole sample burst. Derived from the baud rate when unset.
    pub burst: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_millis(PROBE_TIMEOUT_MS),
            register: Duration::from_millis(REGISTER_TIMEOUT_MS),
            tune_wait: Duration::from_millis(TUNE_WAIT_MS),
            tune_margin: Duration::from_millis(TUNE_MARGIN_MS),
            burst: None,
        }
    }
}

impl Timeouts {
    /// Minimum time between starting a tune and reading its results.
    pub fn tune_minimum(&self) -> Duration {
        self.tune_wait + self.tune_margin
    }

    /// Budget for one full sample burst at `baud`: twice the line time of
    /// all frames plus a fixed slack, unless configured explicitly.
    pub fn burst_for(&self, baud: u32) -> Duration {
        if let Some(burst) = self.burst {
            return burst;
        }
        let bits = (BURST_LEN as u64 + 1) * 4 * BITS_PER_BYTE;
        let line_us = bits * 1_000_000 / u64::from(baud.max(1));
        Duration::from_micros(line_us * 2) + Duration::from_millis(BURST_SLACK_MS)
    }
}

/// USB id filter for candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsbFilter {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl UsbFilter {
    pub const FTDI: UsbFilter = UsbFilter {
        vid: Some(FTDI_VID),
        pid: Some(FTDI_PID),
    };

    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid.map_or(true, |v| v == vid) && self.pid.map_or(true, |p| p == pid)
    }
}

/// Everything a session needs besides the port itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeouts: Timeouts,
    /// Discovery baud rates, in the order tried.
    pub baud_rates: Vec<u32>,
    /// Protocol revisions probed per port and baud, in the order tried.
    pub variants: Vec<ProtocolVariant>,
    /// Restrict discovery to USB ports with these ids.
    pub usb_filter: Option<UsbFilter>,
    /// Send the device-wide baseline on open and release on close.
    pub device_baseline: bool,
    /// Pause before each broadcast zeros frame.
    pub broadcast_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            baud_rates: BAUD_RATES.to_vec(),
            variants: ProtocolVariant::ALL.to_vec(),
            usb_filter: None,
            device_baseline: true,
            broadcast_settle: Duration::from_millis(BROADCAST_SETTLE_MS),
        }
    }
}
