//! Driver for multi-channel SQUID controllers on a serial line.
//!
//! The controller speaks a half-duplex protocol of 4-byte frames
//! `[channel, opcode, hi, lo]`. Requests are acknowledged with `0xFF` in
//! place of the opcode; a verbatim echo means "no such channel" or, during
//! discovery, "a device is listening at this baud rate". Two firmware
//! revisions exist (legacy and 3.4) that differ only in discovery and
//! channel enumeration.
//!
//! A [`Session`] walks the whole lifecycle:
//!
//! 1. [`DeviceProbe`] finds the port, baud rate and protocol revision.
//! 2. A device-wide baseline is broadcast and [`ChannelEnumerator`] lists the
//!    present channels with their capabilities.
//! 3. Each channel gets its initialization sequence; failures leave it
//!    unusable until re-initialized.
//! 4. Parameters are set through the channel functions,
//!    [`AutoTuneController`] runs device-side tuning and
//!    [`SampleStreamReader`] reads 95-sample bursts.
//! 5. A teardown sequence restores safe defaults before the port closes.
//!
//! Nothing is retried inside the driver; [`SquidError::is_retryable`] tells a
//! caller which failures are worth one more attempt.

pub mod autotune;
pub mod channels;
pub mod codec;
pub mod config;
mod errors;
pub mod frame;
pub mod logging;
pub mod probe;
pub mod protocol;
pub mod registers;
pub mod sampling;
pub mod session;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use autotune::{
    AutoTuneController, AutoTuneSession, BusParameter, TuneRequest, TuneResult, TuneState,
    TuneVariant,
};
pub use channels::{Capabilities, Capability, ChannelEnumerator, ChannelInfo, ChannelMetadata};
pub use codec::{Codec, ParameterKind};
pub use config::{SessionConfig, Timeouts, UsbFilter};
pub use errors::*;
pub use frame::Frame;
pub use probe::{available_ports, DeviceProbe, DiscoveredDevice, PortOpener, SerialOpener};
pub use protocol::{ProtocolVariant, Revision};
pub use registers::{Ack, Command, RegisterClient};
pub use sampling::{Sample, SampleBurst, SampleStreamReader};
pub use session::{ChannelState, Session};
pub use transport::{FrameTransport, Link};
