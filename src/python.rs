//! Python bindings (`python` feature).

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::autotune::{TuneRequest, TuneResult, TuneVariant};
use crate::channels::ChannelInfo;
use crate::codec::ParameterKind;
use crate::config::{SessionConfig, UsbFilter};
use crate::errors::SquidError;
use crate::logging;
use crate::probe;
use crate::sampling::SampleBurst;
use crate::session::{ChannelState, Session};

fn to_py_err(e: SquidError) -> PyErr {
    let message = e.to_string();
    match e {
        SquidError::Timeout { .. } => PyTimeoutError::new_err(message),
        SquidError::DeviceNotFound { .. } => PyConnectionError::new_err(message),
        SquidError::UnsupportedCapability { .. }
        | SquidError::ChannelUnavailable(_)
        | SquidError::InvalidArgument(_) => PyValueError::new_err(message),
        SquidError::Io(_) | SquidError::Serial(_) => PyIOError::new_err(message),
        _ => PyRuntimeError::new_err(message),
    }
}

/// One sample burst.
///
/// Attributes:
///     channel: Channel id the burst came from.
///     times: Sample times in seconds, from the first sample.
///     volts: Sample values in volts.
///     raw: Raw signed ADC codes.
#[pyclass(name = "SampleBurst", frozen)]
#[derive(Clone)]
struct PySampleBurst {
    #[pyo3(get)]
    channel: u8,
    #[pyo3(get)]
    times: Vec<f64>,
    #[pyo3(get)]
    volts: Vec<f64>,
    #[pyo3(get)]
    raw: Vec<i16>,
    amplitude: f64,
    offset: f64,
}

#[pymethods]
impl PySampleBurst {
    fn __len__(&self) -> usize {
        self.volts.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "SampleBurst(channel={:#04x}, samples={}, amplitude={:.4}, offset={:.4})",
            self.channel,
            self.volts.len(),
            self.amplitude,
            self.offset
        )
    }

    /// Peak-to-peak amplitude in volts.
    #[getter]
    fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Mean value in volts.
    #[getter]
    fn offset(&self) -> f64 {
        self.offset
    }
}

impl From<SampleBurst> for PySampleBurst {
    fn from(burst: SampleBurst) -> Self {
        let (amplitude, offset) = burst.amplitude_and_offset();
        let (times, volts) = burst.series().into_iter().unzip();
        PySampleBurst {
            channel: burst.channel,
            times,
            volts,
            raw: burst.samples().iter().map(|s| s.raw).collect(),
            amplitude,
            offset,
        }
    }
}

fn channel_dict<'py>(
    py: Python<'py>,
    info: &ChannelInfo,
    state: Option<ChannelState>,
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("id", info.id)?;
    dict.set_item("ready", state == Some(ChannelState::Ready))?;
    let capabilities: Vec<String> = info
        .capabilities
        .iter()
        .map(|c| format!("{c:?}"))
        .collect();
    dict.set_item("capabilities", capabilities)?;
    if let Some(meta) = info.metadata {
        dict.set_item("firmware", meta.firmware_id)?;
        dict.set_item("creation_date", meta.creation_date_raw())?;
        dict.set_item("serial_number", meta.serial_number)?;
    }
    Ok(dict)
}

fn tune_dict<'py>(py: Python<'py>, result: &TuneResult) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("bias", result.bias)?;
    dict.set_item("offset", result.offset)?;
    dict.set_item("flux", result.flux)?;
    dict.set_item("bias_code", result.bias_code)?;
    dict.set_item("offset_code", result.offset_code)?;
    dict.set_item("flux_code", result.flux_code)?;
    Ok(dict)
}

/// A connected SQUID controller.
///
/// Example:
///     >>> squid = Squid.connect()
///     >>> squid.channel_ids
///     [1, 2]
///     >>> squid.set(1, "bias", 0.75)
///     >>> burst = squid.sample(1)
///     >>> squid.close()
#[pyclass(name = "Squid", unsendable)]
struct PySquid {
    inner: Option<Session>,
}

impl PySquid {
    fn session(&mut self) -> PyResult<&mut Session> {
        self.inner
            .as_mut()
            .ok_or_else(|| PyRuntimeError::new_err("session is closed"))
    }
}

#[pymethods]
impl PySquid {
    /// Discover a controller and open a session.
    ///
    /// Args:
    ///     port: Serial port to use. Default: probe every port.
    ///     ftdi_only: Only consider FTDI USB adapters when probing.
    #[staticmethod]
    #[pyo3(signature = (port=None, ftdi_only=true))]
    fn connect(py: Python<'_>, port: Option<String>, ftdi_only: bool) -> PyResult<Self> {
        let mut config = SessionConfig::default();
        if ftdi_only {
            config.usb_filter = Some(UsbFilter::FTDI);
        }
        let session = py
            .detach(move || match port {
                Some(port) => Session::connect_port(&port, config),
                None => Session::connect(config),
            })
            .map_err(to_py_err)?;
        Ok(PySquid {
            inner: Some(session),
        })
    }

    #[getter]
    fn port(&mut self) -> PyResult<String> {
        Ok(self.session()?.port().to_string())
    }

    #[getter]
    fn baud(&mut self) -> PyResult<u32> {
        Ok(self.session()?.baud())
    }

    #[getter]
    fn protocol(&mut self) -> PyResult<String> {
        Ok(self.session()?.variant().to_string())
    }

    /// Ids of channels that initialized successfully.
    #[getter]
    fn channel_ids(&mut self) -> PyResult<Vec<u8>> {
        Ok(self.session()?.ready_channels())
    }

    /// Every enumerated channel as a dict.
    fn channels<'py>(&mut self, py: Python<'py>) -> PyResult<Vec<Bound<'py, PyDict>>> {
        let session: &Session = self.session()?;
        session
            .channels()
            .map(|info| channel_dict(py, info, session.channel_state(info.id)))
            .collect()
    }

    /// Set an analog parameter in physical units.
    ///
    /// Args:
    ///     channel: Channel id.
    ///     parameter: One of "bias", "dc-bias", "offset", "flux",
    ///         "detector-bias", "heat-squid", "heat-detector".
    ///     value: Physical value; out of range values are clamped.
    ///
    /// Returns:
    ///     The value the device acknowledged.
    fn set(&mut self, py: Python<'_>, channel: u8, parameter: &str, value: f64) -> PyResult<f64> {
        let kind: ParameterKind = parameter.parse().map_err(to_py_err)?;
        let session = self.session()?;
        py.detach(|| session.set(channel, kind, value))
            .map_err(to_py_err)
    }

    fn ac_flux(&mut self, py: Python<'_>, channel: u8, on: bool) -> PyResult<()> {
        let session = self.session()?;
        py.detach(|| session.ac_flux(channel, on)).map_err(to_py_err)
    }

    fn test_in(&mut self, py: Python<'_>, channel: u8, on: bool) -> PyResult<()> {
        let session = self.session()?;
        py.detach(|| session.test_in(channel, on)).map_err(to_py_err)
    }

    fn reset_fll(&mut self, py: Python<'_>, channel: u8, on: bool) -> PyResult<()> {
        let session = self.session()?;
        py.detach(|| session.reset_fll(channel, on)).map_err(to_py_err)
    }

    fn fast_reset_fll(&mut self, py: Python<'_>, channel: u8) -> PyResult<()> {
        let session = self.session()?;
        py.detach(|| session.fast_reset_fll(channel)).map_err(to_py_err)
    }

    /// Move the AC flux amplitude by `delta` potentiometer taps (±31).
    fn change_ac_flux_amplitude(&mut self, py: Python<'_>, channel: u8, delta: i32) -> PyResult<i32> {
        let session = self.session()?;
        py.detach(|| session.change_ac_flux_amplitude(channel, delta))
            .map_err(to_py_err)
    }

    /// Write an auto-tune parameter at a parameter bus address.
    fn write_bus(
        &mut self,
        py: Python<'_>,
        channel: u8,
        address: u16,
        parameter: &str,
        value: f64,
    ) -> PyResult<u16> {
        let kind: ParameterKind = parameter.parse().map_err(to_py_err)?;
        let session = self.session()?;
        py.detach(|| session.write_bus(channel, address, kind, value))
            .map_err(to_py_err)
    }

    fn read_register(&mut self, py: Python<'_>, channel: u8, subaddress: u16) -> PyResult<u16> {
        let session = self.session()?;
        py.detach(|| session.read_register(channel, subaddress))
            .map_err(to_py_err)
    }

    /// Run the device auto-tune (blocks about 6.5 s).
    ///
    /// Args:
    ///     channel: Channel id.
    ///     start_bias: Start of the bias search range (-2.5..2.5).
    ///     end_bias: End of the bias search range (-2.5..2.5).
    ///     reset: Zero offset/flux and switch loop controls off first.
    ///
    /// Returns:
    ///     Dict with the tuned bias, offset and flux.
    #[pyo3(signature = (channel, start_bias, end_bias, reset=true))]
    fn auto_tune<'py>(
        &mut self,
        py: Python<'py>,
        channel: u8,
        start_bias: f64,
        end_bias: f64,
        reset: bool,
    ) -> PyResult<Bound<'py, PyDict>> {
        let variant = if reset {
            TuneVariant::Squid
        } else {
            TuneVariant::Squid2
        };
        let request = TuneRequest::new(variant, start_bias, end_bias);
        let session = self.session()?;
        // Other Python threads keep running during the tune wait.
        let result = py
            .detach(|| session.auto_tune(channel, request))
            .map_err(to_py_err)?;
        tune_dict(py, &result)
    }

    /// Tuned values stored by the last auto-tune.
    fn tuned_values<'py>(&mut self, py: Python<'py>, channel: u8) -> PyResult<Bound<'py, PyDict>> {
        let session = self.session()?;
        let result = py
            .detach(|| session.read_tuned_values(channel))
            .map_err(to_py_err)?;
        tune_dict(py, &result)
    }

    /// Stored auto-tune range as `(start, end)`.
    fn tune_range(&mut self, py: Python<'_>, channel: u8) -> PyResult<(f64, f64)> {
        let session = self.session()?;
        py.detach(|| session.read_tune_range(channel))
            .map_err(to_py_err)
    }

    /// Trigger and read one 95-sample burst.
    fn sample(&mut self, py: Python<'_>, channel: u8) -> PyResult<PySampleBurst> {
        let session = self.session()?;
        py.detach(|| session.sample(channel))
            .map(PySampleBurst::from)
            .map_err(to_py_err)
    }

    /// Tear down every channel and release the port.
    fn close(&mut self, py: Python<'_>) -> PyResult<()> {
        match self.inner.take() {
            Some(session) => py.detach(move || session.close()).map_err(to_py_err),
            None => Ok(()),
        }
    }

    fn __enter__(slf: Py<Self>) -> Py<Self> {
        slf
    }

    #[pyo3(signature = (*_args))]
    fn __exit__(&mut self, py: Python<'_>, _args: &Bound<'_, pyo3::types::PyTuple>) -> PyResult<bool> {
        self.close(py)?;
        Ok(false)
    }

    fn __repr__(&self) -> String {
        match &self.inner {
            Some(session) => format!(
                "Squid(port={:?}, baud={}, protocol={})",
                session.port(),
                session.baud(),
                session.variant()
            ),
            None => "Squid(closed)".to_string(),
        }
    }
}

/// Serial ports on this host, optionally filtered by USB vendor/product id.
#[pyfunction]
#[pyo3(signature = (vid=None, pid=None))]
fn available_ports(vid: Option<u16>, pid: Option<u16>) -> PyResult<Vec<String>> {
    let filter = (vid.is_some() || pid.is_some()).then_some(UsbFilter { vid, pid });
    probe::available_ports(filter).map_err(to_py_err)
}

/// Route Rust log records into Python's `logging` at `level` (or the
/// `SQUID_LOG` level when omitted).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level(py, level)
}

#[pymodule]
fn squid_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;

    m.add_class::<PySquid>()?;
    m.add_class::<PySampleBurst>()?;
    m.add_function(wrap_pyfunction!(available_ports, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("BAUD_RATES", crate::config::BAUD_RATES.to_vec())?;
    m.add("BURST_LEN", crate::sampling::BURST_LEN)?;
    m.add(
        "PARAMETERS",
        ParameterKind::ALL.iter().map(|k| k.name()).collect::<Vec<_>>(),
    )?;
    Ok(())
}
