#![ doc = include_str!( concat!( env!( "CARGO_MANIFEST_DIR" ), "/", "README.md" ) ) ]
#![deny(missing_docs)]
use core::{fmt, num};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{env, time::Duration};

pub use log::LevelFilter;

pub use rtsc::locking;

/// Driver configuration (a resolved settings record)
pub mod config;
/// Driver lifecycle manager
pub mod manager;
/// Point store: the four Modbus memory areas with quality/timestamp metadata
pub mod points;
/// Per-client-IP connection accounting
pub mod registry;
/// Client connection limiting
mod semaphore;
/// The Modbus TCP server engine
pub mod server;
/// Task supervisor to manage the driver threads
pub mod supervisor;
/// Named thread builder/handle helpers
pub mod tasks;
/// Engine watchdog
mod watchdog;

#[cfg(test)]
pub(crate) mod testsup;

/// The crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested address is not present in the configured area
    #[error("point not found")]
    NotFound,
    /// Write attempted on a read-only area from an external path
    #[error("the area is read-only")]
    AccessDenied,
    /// Register value outside of `[-32768, 65535]`
    #[error("value {0} is out of range")]
    OutOfRange(i64),
    /// Invalid data received / parameters provided
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The engine is not running, the requested operation requires it
    #[error("the driver is not running")]
    Unavailable,
    /// The engine failed to bind or did not become ready in time
    #[error("startup failed: {0}")]
    Startup(String),
    /// Timeouts
    #[error("timed out")]
    Timeout,
    /// Standard I/O errors
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    /// Non-standard I/O and protocol errors
    #[error("communication error: {0}")]
    Comm(String),
    /// Supervisor error: task name is not specified in the thread builder
    #[error("Task name must be specified when spawning by a supervisor")]
    SupervisorNameNotSpecified,
    /// Supervisor error: task with the given name is already registered
    #[error("Task already registered: `{0}`")]
    SupervisorDuplicateTask(String),
    /// Supervisor error: task with the given name is not found
    #[error("Task not found")]
    SupervisorTaskNotFound,
    /// All other errors
    #[error("operation failed: {0}")]
    Failed(String),
}

macro_rules! impl_error {
    ($t: ty, $key: ident) => {
        impl From<$t> for Error {
            fn from(err: $t) -> Self {
                Error::$key(err.to_string())
            }
        }
    };
}

impl_error!(rmodbus::ErrorKind, Comm);
impl_error!(num::ParseIntError, InvalidData);

impl Error {
    /// Creates new invalid data error
    pub fn invalid_data<S: fmt::Display>(msg: S) -> Self {
        Error::InvalidData(msg.to_string())
    }
    /// Creates new I/O error (for non-standard I/O)
    pub fn io<S: fmt::Display>(msg: S) -> Self {
        Error::Comm(msg.to_string())
    }
    /// Creates new startup error
    pub fn startup<S: fmt::Display>(msg: S) -> Self {
        Error::Startup(msg.to_string())
    }
    /// Creates new function failed error
    pub fn failed<S: fmt::Display>(msg: S) -> Self {
        Error::Failed(msg.to_string())
    }
}

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Enables/disables verbose point tracing, process-wide. The flag is consulted by the engine
/// read/write paths with relaxed ordering, so the toggle is cheap and lock-free.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

/// Returns the current state of the process-wide tracing flag
pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Default Modbus TCP port served by the engine (a test-friendly alternative to the reserved 502)
pub const DEFAULT_PORT: u16 = 5020;

/// The poll step used by readiness/accept loops
pub(crate) const POLL_STEP: Duration = Duration::from_millis(100);

/// Returns true if started in production mode (as a systemd unit)
pub fn is_production() -> bool {
    env::var("INVOCATION_ID").map_or(false, |v| !v.is_empty())
}

/// Configures stdout logger with the given filter. If started in production mode, does not log
/// timestamps
pub fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stdout);
    builder.filter_level(filter);
    if is_production() {
        builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    }
    builder.init();
}

/// Prelude module
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::manager::{Driver, Status};
    pub use crate::points::{Area, Point, PointStore, Quality};
    pub use crate::registry::ConnectionRecord;
    pub use crate::{Error, Result};
    pub use bma_ts::{Monotonic, Timestamp};
    pub use std::time::Duration;
}
