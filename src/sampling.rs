//! Sample burst acquisition.
//!
//! One trigger frame `<ch> 18 00 00` makes the channel stream exactly
//! [`BURST_LEN`] frames `<ch> <index> <value>`, indices `0x00..=0x5E` in order.
//! The device does not timestamp samples; they are spaced by
//! [`SAMPLE_PERIOD_S`] from the first one.

use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SquidError};
use crate::frame::{Frame, OP_SAMPLE_BURST};
use crate::transport::FrameTransport;

/// Frames in one burst.
pub const BURST_LEN: usize = 95;

/// Time between consecutive samples (10 kHz).
pub const SAMPLE_PERIOD_S: f64 = 1.0e-4;

/// ADC full scale in volts for a raw code of 32768.
pub const FULL_SCALE_VOLTS: f64 = 10.0;

/// One raw ADC sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub index: u8,
    pub raw: i16,
}

impl Sample {
    #[inline]
    pub fn volts(&self) -> f64 {
        self.raw as f64 / 32768.0 * FULL_SCALE_VOLTS
    }

    #[inline]
    pub fn time_seconds(&self) -> f64 {
        self.index as f64 * SAMPLE_PERIOD_S
    }
}

/// A complete, validated burst from one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBurst {
    pub channel: u8,
    samples: Vec<Sample>,
}

impl SampleBurst {
    /// Validate and decode a burst. Any gap, repeat, reordering or foreign
    /// channel byte discards the whole burst.
    pub fn decode(channel: u8, frames: &[Frame]) -> Result<Self> {
        if frames.len() != BURST_LEN {
            return Err(SquidError::StreamCorruption {
                channel,
                position: frames.len().min(BURST_LEN),
                detail: format!("expected {BURST_LEN} frames, got {}", frames.len()),
            });
        }

        let mut samples = Vec::with_capacity(BURST_LEN);
        for (position, frame) in frames.iter().enumerate() {
            if frame.channel() != channel {
                return Err(SquidError::StreamCorruption {
                    channel,
                    position,
                    detail: format!("frame {frame} addressed to another channel"),
                });
            }
            let index = frame.opcode();
            if index as usize != position {
                return Err(SquidError::StreamCorruption {
                    channel,
                    position,
                    detail: format!("index {index:#04x} where {position:#04x} was expected"),
                });
            }
            samples.push(Sample {
                index,
                raw: frame.payload() as i16,
            });
        }
        Ok(Self { channel, samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `(time_seconds, volts)` pairs.
    pub fn series(&self) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .map(|s| (s.time_seconds(), s.volts()))
            .collect()
    }

    /// Peak-to-peak and mean, in volts.
    pub fn amplitude_and_offset(&self) -> (f64, f64) {
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in self.samples.iter().map(Sample::volts) {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        (max - min, sum / self.samples.len() as f64)
    }
}

/// Triggers and decodes bursts on one transport.
pub struct SampleStreamReader<'t> {
    transport: &'t mut FrameTransport,
    timeout: Duration,
}

impl<'t> SampleStreamReader<'t> {
    pub fn new(transport: &'t mut FrameTransport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn sample(&mut self, channel: u8) -> Result<SampleBurst> {
        let trigger = Frame::new(channel, OP_SAMPLE_BURST, 0x0000);
        let frames = self.transport.exchange_n(trigger, BURST_LEN, self.timeout)?;
        match SampleBurst::decode(channel, &frames) {
            Ok(burst) => {
                debug!("channel {:#04x}: burst of {} samples", channel, burst.len());
                Ok(burst)
            }
            Err(e) => {
                warn!("channel {:#04x}: burst discarded: {}", channel, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedLink;

    fn burst_frames(channel: u8, indices: impl Iterator<Item = u8>) -> Vec<Frame> {
        indices
            .map(|i| Frame::new(channel, i, (i as i16 * 100 - 4000) as u16))
            .collect()
    }

    #[test]
    fn decodes_full_burst() {
        let frames = burst_frames(0x03, 0..95);
        let burst = SampleBurst::decode(0x03, &frames).unwrap();
        assert_eq!(burst.len(), 95);
        assert!(burst
            .samples()
            .iter()
            .enumerate()
            .all(|(i, s)| s.index as usize == i));
        assert_eq!(burst.samples()[0].raw, -4000);
        assert_eq!(burst.samples()[94].raw, 5400);
    }

    #[test]
    fn missing_index_is_corruption() {
        let frames = burst_frames(0x03, (0..96).filter(|i| *i != 47));
        assert_eq!(frames.len(), 95);
        match SampleBurst::decode(0x03, &frames) {
            Err(SquidError::StreamCorruption { position, .. }) => assert_eq!(position, 47),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn repeated_index_and_foreign_channel_are_corruption() {
        let mut frames = burst_frames(0x03, 0..95);
        frames[10] = Frame::new(0x03, 9, 0);
        assert!(matches!(
            SampleBurst::decode(0x03, &frames),
            Err(SquidError::StreamCorruption { position: 10, .. })
        ));

        let mut frames = burst_frames(0x03, 0..95);
        frames[20] = Frame::new(0x04, 20, 0);
        assert!(matches!(
            SampleBurst::decode(0x03, &frames),
            Err(SquidError::StreamCorruption { position: 20, .. })
        ));
    }

    #[test]
    fn physical_conversion() {
        let sample = Sample {
            index: 10,
            raw: 16384,
        };
        assert!((sample.volts() - 5.0).abs() < 1e-12);
        assert!((sample.time_seconds() - 0.001).abs() < 1e-12);
        let negative = Sample {
            index: 0,
            raw: -32768,
        };
        assert!((negative.volts() + 10.0).abs() < 1e-12);
    }

    #[test]
    fn reader_triggers_and_decodes() {
        let link = ScriptedLink::new();
        let trigger = Frame::new(0x02, 0x18, 0x0000);
        let bytes: Vec<u8> = burst_frames(0x02, 0..95)
            .iter()
            .flat_map(|f| *f.as_bytes())
            .collect();
        link.expect_raw(trigger, bytes);
        let mut transport = FrameTransport::new(link.clone());

        let burst = SampleStreamReader::new(&mut transport, Duration::from_millis(100))
            .sample(0x02)
            .unwrap();
        assert_eq!(burst.channel, 0x02);
        assert_eq!(burst.series().len(), 95);
        assert_eq!(link.sent(), vec![trigger]);
    }

    #[test]
    fn amplitude_and_offset_of_burst() {
        let burst = SampleBurst::decode(0x01, &burst_frames(0x01, 0..95)).unwrap();
        let (amplitude, offset) = burst.amplitude_and_offset();
        let expected_amplitude = 9400.0 / 32768.0 * 10.0;
        assert!((amplitude - expected_amplitude).abs() < 1e-9);
        let expected_offset = 700.0 / 32768.0 * 10.0;
        assert!((offset - expected_offset).abs() < 1e-9);
    }
}
