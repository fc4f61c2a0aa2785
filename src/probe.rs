//! Locating a controller: which port, which baud rate, which protocol.
//!
//! Every candidate port is opened at each configured baud rate and sent each
//! revision's discovery frame. A listening controller echoes that frame
//! verbatim; the first port/baud/revision in candidate order that does so
//! wins.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use serialport::SerialPortType;

use crate::config::{SessionConfig, UsbFilter};
use crate::errors::{Result, SquidError};
use crate::protocol::ProtocolVariant;
use crate::transport::{open_serial, FrameTransport, Link};

/// Opens a byte link to a port at a given baud rate.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Link>>;
}

/// Opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Link>> {
        Ok(Box::new(open_serial(port, baud, timeout)?))
    }
}

/// A controller that answered discovery, with its port still open.
pub struct DiscoveredDevice {
    pub port: String,
    pub baud: u32,
    pub variant: ProtocolVariant,
    pub transport: FrameTransport,
}

impl fmt::Debug for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveredDevice")
            .field("port", &self.port)
            .field("baud", &self.baud)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Names of serial ports on this host, optionally restricted to USB
/// adapters matching `filter`.
pub fn available_ports(filter: Option<UsbFilter>) -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    let names: Vec<String> = ports
        .into_iter()
        .filter(|p| match (&filter, &p.port_type) {
            (None, _) => true,
            (Some(filter), SerialPortType::UsbPort(usb)) => filter.matches(usb.vid, usb.pid),
            (Some(_), _) => false,
        })
        .map(|p| p.port_name)
        .collect();
    debug!("candidate ports: {:?}", names);
    Ok(names)
}

/// Discovery over a list of candidate ports.
pub struct DeviceProbe<O = SerialOpener> {
    opener: O,
    baud_rates: Vec<u32>,
    variants: Vec<ProtocolVariant>,
    timeout: Duration,
}

impl DeviceProbe<SerialOpener> {
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_opener(SerialOpener, config)
    }
}

impl<O: PortOpener> DeviceProbe<O> {
    pub fn with_opener(opener: O, config: &SessionConfig) -> Self {
        Self {
            opener,
            baud_rates: config.baud_rates.clone(),
            variants: config.variants.clone(),
            timeout: config.timeouts.probe,
        }
    }

    /// Try every baud rate and revision on one port.
    pub fn probe_port(&self, port: &str) -> Result<Option<DiscoveredDevice>> {
        for &baud in &self.baud_rates {
            let link = match self.opener.open(port, baud, self.timeout) {
                Ok(link) => link,
                Err(e) => {
                    warn!("cannot open {} at {} baud: {}", port, baud, e);
                    continue;
                }
            };
            let mut transport = FrameTransport::from_boxed(link);

            for &variant in &self.variants {
                let request = variant.revision().discovery_frame();
                match transport.exchange(request, self.timeout) {
                    Ok(response) if response == request => {
                        info!(
                            "controller found: port={}, baud={}, protocol={}",
                            port, baud, variant
                        );
                        return Ok(Some(DiscoveredDevice {
                            port: port.to_string(),
                            baud,
                            variant,
                            transport,
                        }));
                    }
                    Ok(response) => {
                        debug!("{} @ {}: {} answered {}", port, baud, request, response)
                    }
                    Err(e) if e.is_timeout() => {
                        debug!("{} @ {}: no echo for {} protocol", port, baud, variant)
                    }
                    Err(e) => {
                        warn!("{} @ {}: {}", port, baud, e);
                        break;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Probe `ports` one after another.
    pub fn discover(&self, ports: &[String]) -> Result<DiscoveredDevice> {
        for port in ports {
            if let Some(device) = self.probe_port(port)? {
                return Ok(device);
            }
        }
        Err(self.not_found(ports.len()))
    }

    /// Every controller among `ports`, at most one per port.
    pub fn scan(&self, ports: &[String]) -> Result<Vec<DiscoveredDevice>> {
        let mut found = Vec::new();
        for port in ports {
            found.extend(self.probe_port(port)?);
        }
        Ok(found)
    }

    fn not_found(&self, ports: usize) -> SquidError {
        let candidates = ports * self.baud_rates.len();
        warn!("no controller on {} port/baud combination(s)", candidates);
        SquidError::DeviceNotFound { candidates }
    }
}

impl<O: PortOpener + 'static> DeviceProbe<O> {
    /// Probe all `ports` at once, each on a blocking worker. Ties resolve to
    /// the earliest port in `ports`; other open links are dropped.
    pub async fn discover_concurrently(self: Arc<Self>, ports: Vec<String>) -> Result<DiscoveredDevice> {
        let tasks = ports.iter().cloned().map(|port| {
            let probe = Arc::clone(&self);
            tokio::task::spawn_blocking(move || probe.probe_port(&port))
        });
        let outcomes = join_all(tasks).await;

        let mut found = None;
        for (port, outcome) in ports.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(Some(device))) if found.is_none() => found = Some(device),
                Ok(Ok(Some(device))) => {
                    debug!("ignoring second controller on {}", device.port)
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!("probe of {} failed: {}", port, e),
                Err(e) => {
                    return Err(SquidError::Io(io::Error::other(format!(
                        "probe task for {port} failed: {e}"
                    ))))
                }
            }
        }
        found.ok_or_else(|| self.not_found(ports.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    use super::*;
    use crate::frame::{Frame, FRAME_LEN};

    /// Echoes the listed frames verbatim and ignores everything else.
    struct EchoLink {
        echoes: Vec<Frame>,
        rx: VecDeque<u8>,
        timeout: Duration,
    }

    impl Write for EchoLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(bytes) = <[u8; FRAME_LEN]>::try_from(buf) {
                let frame = Frame::from_bytes(bytes);
                if self.echoes.contains(&frame) {
                    self.rx.extend(bytes);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for EchoLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                std::thread::sleep(self.timeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "silent"));
            }
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Link for EchoLink {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }
    }

    /// A controller at one port/baud; every other combination is silent.
    #[derive(Default)]
    struct FakeBench {
        devices: Vec<(String, u32, ProtocolVariant)>,
        missing: Vec<String>,
        opened: Mutex<Vec<(String, u32)>>,
    }

    impl PortOpener for FakeBench {
        fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Link>> {
            if self.missing.iter().any(|p| p == port) {
                return Err(SquidError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no such port",
                )));
            }
            if let Ok(mut opened) = self.opened.lock() {
                opened.push((port.to_string(), baud));
            }
            let echoes = self
                .devices
                .iter()
                .filter(|(p, b, _)| p == port && *b == baud)
                .map(|(_, _, v)| v.revision().discovery_frame())
                .collect();
            Ok(Box::new(EchoLink {
                echoes,
                rx: VecDeque::new(),
                timeout,
            }))
        }
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.timeouts.probe = Duration::from_millis(10);
        config
    }

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finds_device_at_non_default_baud() {
        let bench = FakeBench {
            devices: vec![("/dev/ttyUSB1".into(), 38400, ProtocolVariant::V3_4)],
            ..Default::default()
        };
        let probe = DeviceProbe::with_opener(bench, &config());

        let device = probe.discover(&ports(&["/dev/ttyUSB0", "/dev/ttyUSB1"])).unwrap();
        assert_eq!(device.port, "/dev/ttyUSB1");
        assert_eq!(device.baud, 38400);
        assert_eq!(device.variant, ProtocolVariant::V3_4);

        let opened = probe.opener.opened.lock().unwrap().clone();
        // All four rates on the first port, then 57600 and 9600 before 38400.
        assert_eq!(opened.len(), 4 + 3);
        assert_eq!(opened[4], ("/dev/ttyUSB1".to_string(), 57600));
        assert_eq!(opened[6], ("/dev/ttyUSB1".to_string(), 38400));
    }

    #[test]
    fn detects_legacy_protocol() {
        let bench = FakeBench {
            devices: vec![("COM3".into(), 57600, ProtocolVariant::Legacy)],
            ..Default::default()
        };
        let device = DeviceProbe::with_opener(bench, &config())
            .discover(&ports(&["COM3"]))
            .unwrap();
        assert_eq!(device.variant, ProtocolVariant::Legacy);
    }

    #[test]
    fn not_found_reports_candidate_count() {
        let bench = FakeBench {
            missing: vec!["/dev/ttyUSB9".into()],
            ..Default::default()
        };
        let err = DeviceProbe::with_opener(bench, &config())
            .discover(&ports(&["/dev/ttyUSB0", "/dev/ttyUSB9"]))
            .unwrap_err();
        assert!(matches!(err, SquidError::DeviceNotFound { candidates: 8 }));
    }

    #[test]
    fn empty_port_list_is_not_found() {
        let err = DeviceProbe::with_opener(FakeBench::default(), &config())
            .discover(&[])
            .unwrap_err();
        assert!(matches!(err, SquidError::DeviceNotFound { candidates: 0 }));
    }

    #[test]
    fn scan_lists_every_answering_port() {
        let bench = FakeBench {
            devices: vec![
                ("/dev/ttyUSB0".into(), 57600, ProtocolVariant::V3_4),
                ("/dev/ttyUSB2".into(), 19200, ProtocolVariant::V3_4),
            ],
            ..Default::default()
        };
        let found = DeviceProbe::with_opener(bench, &config())
            .scan(&ports(&["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]))
            .unwrap();
        let summary: Vec<_> = found.iter().map(|d| (d.port.as_str(), d.baud)).collect();
        assert_eq!(summary, vec![("/dev/ttyUSB0", 57600), ("/dev/ttyUSB2", 19200)]);
    }

    #[tokio::test]
    async fn concurrent_discovery_prefers_candidate_order() {
        let bench = FakeBench {
            devices: vec![
                ("/dev/ttyUSB2".into(), 9600, ProtocolVariant::V3_4),
                ("/dev/ttyUSB1".into(), 19200, ProtocolVariant::Legacy),
            ],
            ..Default::default()
        };
        let probe = Arc::new(DeviceProbe::with_opener(bench, &config()));

        let device = probe
            .discover_concurrently(ports(&["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]))
            .await
            .unwrap();
        assert_eq!(device.port, "/dev/ttyUSB1");
        assert_eq!(device.baud, 19200);
        assert_eq!(device.variant, ProtocolVariant::Legacy);
    }
}
