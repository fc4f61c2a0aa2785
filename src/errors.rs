use std::io;
use thiserror::Error;

use crate::channels::Capability;
use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum SquidError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no SQUID controller answered on {candidates} port/baud combination(s)")]
    DeviceNotFound { candidates: usize },
    #[error("timeout: no response to {request} within {timeout_ms} ms")]
    Timeout { request: Frame, timeout_ms: u128 },
    #[error("incomplete response: expected {expected} frame(s), received {received}")]
    Incomplete { expected: usize, received: usize },
    #[error("echo mismatch: sent {request}, received {response}")]
    EchoMismatch { request: Frame, response: Frame },
    #[error("channel {channel:#04x} does not support {capability:?}")]
    UnsupportedCapability { channel: u8, capability: Capability },
    #[error("channel {channel:#04x} reported unrecognized hardware code {code:#06x}")]
    UnrecognizedCapability { channel: u8, code: u16 },
    #[error("sample stream corrupted on channel {channel:#04x} at frame {position}: {detail}")]
    StreamCorruption {
        channel: u8,
        position: usize,
        detail: String,
    },
    #[error("channel {channel:#04x} not safely initialized (step '{step}' failed): {source}")]
    InitializationFailed {
        channel: u8,
        step: &'static str,
        #[source]
        source: Box<SquidError>,
    },
    #[error("channel {0:#04x} is not available for operation")]
    ChannelUnavailable(u8),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SquidError {
    /// Whether a caller may reasonably retry the failed operation once.
    ///
    /// The engine itself never retries; this only informs caller policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SquidError::Timeout { .. }
                | SquidError::EchoMismatch { .. }
                | SquidError::StreamCorruption { .. }
                | SquidError::Incomplete { .. }
        )
    }

    /// Whether the error came from the device not answering at all.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SquidError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, SquidError>;
