//! Fixed-point calibration between physical units and 16-bit wire codes.
//!
//! Every analog parameter is a linear map `code = zero + value * scale`,
//! clamped first to the parameter's declared range and then to
//! `0x0000..=0xFFFF`. The AC flux amplitude is the exception: it carries a
//! signed, relative potentiometer tap delta as a two's-complement word.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SquidError;
use crate::frame::{
    OP_AC_FLUX_AMPLITUDE, OP_BIAS, OP_DC_BIAS, OP_DETECTOR_BIAS, OP_FLUX, OP_HEAT_DETECTOR,
    OP_HEAT_SQUID, OP_OFFSET, OP_PARAMETER_BUS,
};

/// Largest relative tap step the AC flux amplitude potentiometer accepts.
pub const MAX_TAP_DELTA: i32 = 31;

/// Tap delta sent once at startup to move from power-up mid-scale to the
/// usual operating amplitude.
pub const STARTUP_TAP_DELTA: i32 = -12;

/// A linear physical-unit <-> code conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Codec {
    /// Code corresponding to a physical value of exactly zero.
    offset: f64,
    /// Codes per physical unit.
    scale: f64,
    min: f64,
    max: f64,
}

impl Codec {
    pub const fn new(offset: f64, scale: f64, min: f64, max: f64) -> Self {
        Self {
            offset,
            scale,
            min,
            max,
        }
    }

    /// Convert a physical value to its wire code, clamping instead of failing.
    ///
    /// NaN is treated as zero.
    pub fn encode(&self, value: f64) -> u16 {
        let value = if value.is_nan() {
            0.0
        } else {
            value.clamp(self.min, self.max)
        };
        let code = (self.offset + value * self.scale).round();
        code.clamp(0.0, u16::MAX as f64) as u16
    }

    /// Convert a wire code back to its physical value.
    pub fn decode(&self, code: u16) -> f64 {
        (code as f64 - self.offset) / self.scale
    }

    /// Physical size of one code step.
    pub fn resolution(&self) -> f64 {
        1.0 / self.scale
    }

    /// Declared physical range `(min, max)`.
    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

/// ±2.5 full scale around mid-code, `0x3333` per unit.
///
/// Rounding is half away from zero, so `-2.5` lands on `0x0001` and `+2.5`
/// saturates at `0xFFFF`. Code `0x0000` decodes to just below `-2.5`.
pub const SYMMETRIC: Codec = Codec::new(32768.0, 13107.0, -2.5, 2.5);
/// `0x6666` per 100 µA, 0..250 µA.
pub const DETECTOR_BIAS: Codec = Codec::new(0.0, 262.14, 0.0, 250.0);
/// One code per millisecond.
pub const HEAT_SQUID: Codec = Codec::new(0.0, 1.0, 0.0, 65535.0);
/// `0x8000` per 500 µA.
pub const HEAT_DETECTOR: Codec = Codec::new(0.0, 65.536, 0.0, 500.0);
pub const HEAT_TIME: Codec = Codec::new(0.0, 1.0, 0.0, 20.0);
pub const WAITING_TIME: Codec = Codec::new(0.0, 1.0, 0.0, 300.0);
/// One code per µV with a 20 µV floor (`0x0014`).
pub const SQUID_HUB: Codec = Codec::new(0.0, 1.0, 20.0, 4000.0);

/// Encode a signed relative tap delta, clamped to ±[`MAX_TAP_DELTA`].
pub fn encode_tap_delta(delta: i32) -> u16 {
    delta.clamp(-MAX_TAP_DELTA, MAX_TAP_DELTA) as i16 as u16
}

/// Decode an acknowledged tap delta.
pub fn decode_tap_delta(code: u16) -> i32 {
    code as i16 as i32
}

/// Every analog parameter the controller exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    Bias,
    DcBias,
    Offset,
    Flux,
    DetectorBias,
    HeatSquid,
    HeatDetector,
    AcFluxAmplitude,
    HeatTime,
    WaitingTime,
    SquidHub,
}

impl ParameterKind {
    pub const ALL: [ParameterKind; 11] = [
        ParameterKind::Bias,
        ParameterKind::DcBias,
        ParameterKind::Offset,
        ParameterKind::Flux,
        ParameterKind::DetectorBias,
        ParameterKind::HeatSquid,
        ParameterKind::HeatDetector,
        ParameterKind::AcFluxAmplitude,
        ParameterKind::HeatTime,
        ParameterKind::WaitingTime,
        ParameterKind::SquidHub,
    ];

    /// Opcode used to write this parameter. Auto-tune parameters share the
    /// parameter bus.
    pub fn opcode(self) -> u8 {
        match self {
            ParameterKind::Bias => OP_BIAS,
            ParameterKind::DcBias => OP_DC_BIAS,
            ParameterKind::Offset => OP_OFFSET,
            ParameterKind::Flux => OP_FLUX,
            ParameterKind::DetectorBias => OP_DETECTOR_BIAS,
            ParameterKind::HeatSquid => OP_HEAT_SQUID,
            ParameterKind::HeatDetector => OP_HEAT_DETECTOR,
            ParameterKind::AcFluxAmplitude => OP_AC_FLUX_AMPLITUDE,
            ParameterKind::HeatTime | ParameterKind::WaitingTime | ParameterKind::SquidHub => {
                OP_PARAMETER_BUS
            }
        }
    }

    /// Linear codec, or `None` for the relative tap delta.
    pub fn codec(self) -> Option<Codec> {
        match self {
            ParameterKind::Bias
            | ParameterKind::DcBias
            | ParameterKind::Offset
            | ParameterKind::Flux => Some(SYMMETRIC),
            ParameterKind::DetectorBias => Some(DETECTOR_BIAS),
            ParameterKind::HeatSquid => Some(HEAT_SQUID),
            ParameterKind::HeatDetector => Some(HEAT_DETECTOR),
            ParameterKind::HeatTime => Some(HEAT_TIME),
            ParameterKind::WaitingTime => Some(WAITING_TIME),
            ParameterKind::SquidHub => Some(SQUID_HUB),
            ParameterKind::AcFluxAmplitude => None,
        }
    }

    pub fn encode(self, value: f64) -> u16 {
        match self.codec() {
            Some(codec) => codec.encode(value),
            None if value.is_nan() => encode_tap_delta(0),
            None => encode_tap_delta(value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32),
        }
    }

    pub fn decode(self, code: u16) -> f64 {
        match self.codec() {
            Some(codec) => codec.decode(code),
            None => decode_tap_delta(code) as f64,
        }
    }

    /// Code that represents a physical zero (after range clamping).
    pub fn zero_code(self) -> u16 {
        self.encode(0.0)
    }

    /// Lower-case hyphenated name, as accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            ParameterKind::Bias => "bias",
            ParameterKind::DcBias => "dc-bias",
            ParameterKind::Offset => "offset",
            ParameterKind::Flux => "flux",
            ParameterKind::DetectorBias => "detector-bias",
            ParameterKind::HeatSquid => "heat-squid",
            ParameterKind::HeatDetector => "heat-detector",
            ParameterKind::AcFluxAmplitude => "ac-flux-amplitude",
            ParameterKind::HeatTime => "heat-time",
            ParameterKind::WaitingTime => "waiting-time",
            ParameterKind::SquidHub => "squid-hub",
        }
    }

    /// Unit label for display.
    pub fn unit(self) -> &'static str {
        match self {
            ParameterKind::Bias
            | ParameterKind::DcBias
            | ParameterKind::Offset
            | ParameterKind::Flux => "",
            ParameterKind::DetectorBias | ParameterKind::HeatDetector => "µA",
            ParameterKind::HeatSquid => "ms",
            ParameterKind::HeatTime | ParameterKind::WaitingTime => "s",
            ParameterKind::SquidHub => "µV",
            ParameterKind::AcFluxAmplitude => "taps",
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParameterKind {
    type Err = SquidError;

    /// Accepts the hyphenated name, with `_` or `-` as separator and any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        ParameterKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| SquidError::InvalidArgument(format!("unknown parameter '{s}'")))
    }
}
