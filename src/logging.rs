//! Log setup for the demo binary and, with the `python` feature, a bridge
//! that forwards `log` records into Python's `logging` module.
//!
//! The level comes from `SQUID_LOG`, then `RUST_LOG`, defaulting to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

const LEVEL_VAR: &str = "SQUID_LOG";
const FALLBACK_VAR: &str = "RUST_LOG";

static STDERR_LOG_ONCE: Once = Once::new();

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Level requested through the environment.
pub fn env_level() -> LevelFilter {
    let from_env = |var| std::env::var(var).ok();
    parse_level(from_env(LEVEL_VAR).as_deref())
        .or_else(|| parse_level(from_env(FALLBACK_VAR).as_deref()))
        .unwrap_or(LevelFilter::Info)
}

/// Install an stderr logger with millisecond timestamps. Later calls are
/// no-ops.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], with an explicit level overriding the environment.
pub fn init_logging_with(level: Option<LevelFilter>) {
    STDERR_LOG_ONCE.call_once(|| {
        let mut builder = match level {
            Some(level) => {
                let mut builder = env_logger::Builder::new();
                builder.filter_level(level);
                builder
            }
            None => {
                // RUST_LOG directives still apply when SQUID_LOG is unset.
                let fallback = std::env::var(FALLBACK_VAR).unwrap_or_else(|_| "info".into());
                env_logger::Builder::from_env(Env::new().filter_or(LEVEL_VAR, fallback))
            }
        };
        let result = builder
            .format_timestamp_millis()
            .format_module_path(false)
            .format_target(true)
            .try_init();
        if result.is_err() {
            log::debug!("a logger was already installed");
        }
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Python `logging` numeric level for a `log` level.
    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    struct PyLogger {
        max_level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        /// Python logger per dotted target.
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, max_level: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                max_level: Mutex::new(max_level),
                logging: py.import("logging")?.unbind(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn logger_for<'py>(&self, py: Python<'py>, target: &str) -> PyResult<Bound<'py, PyAny>> {
            if let Ok(loggers) = self.loggers.lock() {
                if let Some(logger) = loggers.get(target) {
                    return Ok(logger.bind(py).clone());
                }
            }
            let logger = self
                .logging
                .bind(py)
                .call_method1("getLogger", (target,))?;
            if let Ok(mut loggers) = self.loggers.lock() {
                loggers.insert(target.to_string(), logger.clone().unbind());
            }
            Ok(logger)
        }

        fn forward(&self, record: &Record) {
            let target = record.target().replace("::", ".");
            let level = python_level(record.level());
            let message = record.args().to_string();
            Python::attach(|py| {
                let outcome = self.logger_for(py, &target).and_then(|logger| {
                    if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                        logger.call_method1("log", (level, message))?;
                    }
                    Ok(())
                });
                if let Err(e) = outcome {
                    e.restore(py);
                }
            });
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            self.max_level
                .lock()
                .map(|max| metadata.level() <= *max)
                .unwrap_or(false)
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.forward(record);
            }
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Only the first call
    /// installs the bridge.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut failure = None;
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => failure = Some(e),
        });
        failure.map_or(Ok(()), Err)
    }

    /// Forget cached Python loggers (after the Python logging config changed).
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut loggers) = logger.loggers.lock() {
                loggers.clear();
            }
        }
    }

    /// Change the bridged level at runtime; `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = parse_level(level).unwrap_or_else(env_level);
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut max) = logger.max_level.lock() {
                *max = level;
            }
        }
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}
