//! Half-duplex frame exchange over a byte link.
//!
//! The controller answers every request with one 4-byte frame, except the
//! sampling trigger which answers with a fixed-size burst. A new request is
//! only ever sent after the previous response (or its timeout) resolved;
//! `&mut self` on every exchange enforces the single outstanding operation.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::{Result, SquidError};
use crate::frame::{Frame, FRAME_LEN};

// ============================================================================
// Link Abstraction
// ============================================================================

/// A byte link to the controller: Read + Write + Send plus timeout control.
///
/// Implemented for serial ports; tests and simulators implement it directly.
pub trait Link: Read + Write + Send {
    /// Set how long a single `read` may block before reporting a timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Drop any unread input (stale bytes from an earlier timed-out exchange).
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Link for Box<dyn SerialPort> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        SerialPort::clear(self.as_mut(), ClearBuffer::Input)?;
        Ok(())
    }
}

/// Open a serial port configured for the controller (8 data bits, no
/// parity, 1 stop bit, no flow control).
pub fn open_serial(path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(timeout)
        .open()?;
    debug!("opened serial port {} at {} baud", path, baud);
    Ok(port)
}

// ============================================================================
// Frame Transport
// ============================================================================

/// Synchronous request/response exchange of 4-byte frames.
pub struct FrameTransport {
    link: Box<dyn Link>,
    timeout: Option<Duration>,
}

impl FrameTransport {
    pub fn new<L: Link + 'static>(link: L) -> Self {
        Self::from_boxed(Box::new(link))
    }

    pub fn from_boxed(link: Box<dyn Link>) -> Self {
        Self {
            link,
            timeout: None,
        }
    }

    /// Send one frame and receive exactly one frame back.
    pub fn exchange(&mut self, request: Frame, timeout: Duration) -> Result<Frame> {
        self.send(request)?;
        let deadline = Instant::now() + timeout;
        match self.receive(deadline)? {
            Some(response) => {
                debug!("tx {} -> rx {}", request, response);
                Ok(response)
            }
            None => {
                debug!("tx {} -> timeout after {:?}", request, timeout);
                Err(SquidError::Timeout {
                    request,
                    timeout_ms: timeout.as_millis(),
                })
            }
        }
    }

    /// Send one frame and receive exactly `expected` frames back, all within
    /// `timeout`.
    ///
    /// No frame at all is a `Timeout`; a short burst is `Incomplete`.
    pub fn exchange_n(
        &mut self,
        request: Frame,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<Frame>> {
        self.send(request)?;
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::with_capacity(expected);
        while frames.len() < expected {
            match self.receive(deadline)? {
                Some(frame) => {
                    trace!("rx[{}] {}", frames.len(), frame);
                    frames.push(frame);
                }
                None if frames.is_empty() => {
                    return Err(SquidError::Timeout {
                        request,
                        timeout_ms: timeout.as_millis(),
                    })
                }
                None => {
                    return Err(SquidError::Incomplete {
                        expected,
                        received: frames.len(),
                    })
                }
            }
        }
        debug!("tx {} -> rx {} frame(s)", request, frames.len());
        Ok(frames)
    }

    /// Release the underlying link.
    pub fn into_link(self) -> Box<dyn Link> {
        self.link
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn send(&mut self, request: Frame) -> Result<()> {
        self.link.discard_input()?;
        self.link.write_all(request.as_bytes())?;
        self.link.flush()?;
        Ok(())
    }

    /// Read one frame, or `None` once `deadline` passes.
    fn receive(&mut self, deadline: Instant) -> Result<Option<Frame>> {
        let mut buf = [0u8; FRAME_LEN];
        let mut filled = 0usize;
        while filled < FRAME_LEN {
            let now = Instant::now();
            if now >= deadline {
                if filled > 0 {
                    debug!("dropping partial frame {:02X?}", &buf[..filled]);
                }
                return Ok(None);
            }
            self.apply_timeout(deadline - now)?;
            match self.link.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "link closed while reading a frame",
                    )
                    .into())
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(Frame::from_bytes(buf)))
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.timeout != Some(timeout) {
            self.link.set_timeout(timeout)?;
            self.timeout = Some(timeout);
        }
        Ok(())
    }
}

// ============================================================================
// Scripted Link (tests)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mock::ScriptedLink;
    use super::*;

    const SHORT: Duration = Duration::from_millis(30);

    #[test]
    fn exchange_returns_single_response() {
        let link = ScriptedLink::new();
        let request = Frame::new(0x05, 0x0A, 0x8000);
        link.expect_ack(request);
        let mut transport = FrameTransport::new(link.clone());

        let response = transport.exchange(request, SHORT).unwrap();
        assert_eq!(response.as_bytes(), &[0x05, 0xFF, 0x80, 0x00]);
        assert_eq!(link.sent(), vec![request]);
    }

    #[test]
    fn exchange_times_out_without_retrying() {
        let link = ScriptedLink::new();
        let request = Frame::new(0x01, 0x40, 0x00F0);
        link.expect_raw(request, Vec::new());
        let mut transport = FrameTransport::new(link.clone());

        let err = transport.exchange(request, SHORT).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn exchange_n_collects_burst() {
        let link = ScriptedLink::new();
        let request = Frame::new(0x02, 0x18, 0);
        let burst: Vec<u8> = (0..3u8).flat_map(|i| [0x02, i, 0x00, i]).collect();
        link.expect_raw(request, burst);
        let mut transport = FrameTransport::new(link);

        let frames = transport.exchange_n(request, 3, SHORT).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_bytes(), &[0x02, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn exchange_n_reports_short_burst_as_incomplete() {
        let link = ScriptedLink::new();
        let request = Frame::new(0x02, 0x18, 0);
        // Two whole frames and half of a third.
        let mut burst: Vec<u8> = (0..2u8).flat_map(|i| [0x02, i, 0x00, i]).collect();
        burst.extend([0x02, 0x02]);
        link.expect_raw(request, burst);
        let mut transport = FrameTransport::new(link);

        match transport.exchange_n(request, 3, SHORT) {
            Err(SquidError::Incomplete { expected, received }) => {
                assert_eq!(expected, 3);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// A link whose far end has gone away: writes succeed, reads hit EOF.
    struct ClosedLink;

    impl Read for ClosedLink {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for ClosedLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Link for ClosedLink {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn closed_link_fails_immediately() {
        let mut transport = FrameTransport::new(ClosedLink);
        let started = Instant::now();

        let err = transport
            .exchange(Frame::new(0x01, 0x40, 0x00F0), Duration::from_secs(2))
            .unwrap_err();
        match err {
            SquidError::Io(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn exchange_n_without_any_frame_is_timeout() {
        let link = ScriptedLink::new();
        let request = Frame::new(0x02, 0x18, 0);
        link.expect_raw(request, Vec::new());
        let mut transport = FrameTransport::new(link);

        let err = transport.exchange_n(request, 95, SHORT).unwrap_err();
        assert!(err.is_timeout());
    }
}
