//! The 4-byte wire frame and the opcode table.
//!
//! Every request and every response on the line is exactly one frame:
//! `[channel, opcode, payload_hi, payload_lo]`. Responses replace the opcode
//! byte with [`ACK`] to acknowledge a command or to report a present channel;
//! a verbatim echo means "absent" (or, for discovery, "device here").

use std::fmt;

/// Size of every frame on the wire.
pub const FRAME_LEN: usize = 4;

/// Opcode byte a response carries to acknowledge a request.
pub const ACK: u8 = 0xFF;

/// Channel byte addressing every channel of a device at once.
pub const BROADCAST: u8 = 0xFF;

// Opcodes (second byte of a request frame)
pub const OP_DC_BIAS: u8 = 0x08;
pub const OP_DETECTOR_BIAS: u8 = 0x09;
pub const OP_BIAS: u8 = 0x0A;
pub const OP_OFFSET: u8 = 0x0B;
pub const OP_FLUX: u8 = 0x0C;
pub const OP_SAMPLE_BURST: u8 = 0x18;
pub const OP_RESET_FLL_OFF: u8 = 0x20;
pub const OP_RESET_FLL_ON: u8 = 0x21;
pub const OP_FAST_RESET_FLL: u8 = 0x22;
pub const OP_AC_FLUX: u8 = 0x29;
pub const OP_HEAT_SQUID: u8 = 0x32;
pub const OP_START_TUNE: u8 = 0x38;
pub const OP_READ_REGISTER: u8 = 0x40;
pub const OP_PARAMETER_BUS: u8 = 0x48;
pub const OP_TEST_IN: u8 = 0x50;
pub const OP_AC_FLUX_AMPLITUDE: u8 = 0x60;
pub const OP_HEAT_DETECTOR: u8 = 0x68;
/// Opcode-less broadcast frame sent after each device-wide "to minimum" command.
pub const OP_ZEROS: u8 = 0x00;

/// One 4-byte protocol frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// Build a frame from its channel, opcode and 16-bit big-endian payload.
    #[inline]
    pub const fn new(channel: u8, opcode: u8, payload: u16) -> Self {
        let [hi, lo] = payload.to_be_bytes();
        Self([channel, opcode, hi, lo])
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    #[inline]
    pub const fn channel(&self) -> u8 {
        self.0[0]
    }

    #[inline]
    pub const fn opcode(&self) -> u8 {
        self.0[1]
    }

    #[inline]
    pub const fn payload(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    /// True if this response acknowledges a request on `channel`.
    #[inline]
    pub const fn is_ack_for(&self, channel: u8) -> bool {
        self.0[0] == channel && self.0[1] == ACK
    }

    /// The acknowledgment the device would give if it accepted `self` verbatim.
    pub const fn acknowledged(&self) -> Self {
        Self([self.0[0], ACK, self.0[2], self.0[3]])
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a:02X} {b:02X} {c:02X} {d:02X}")
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({self})")
    }
}

impl From<[u8; FRAME_LEN]> for Frame {
    fn from(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }
}
