//! Log level handling for the daemon.
//!
//! The daemon exposes five log levels, settable from the config file
//! (`log_level`) and from the command line (`-L`). This crate owns the level
//! type, its textual forms, and the bridge onto `tracing`: the daemon logs
//! through `tracing` macros and this crate installs the subscriber that
//! filters them by the configured level.

use std::fmt;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Maximum severity of messages the daemon will emit.
///
/// Levels are ordered from most to least severe; a configured level admits
/// all messages at that level and above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Fatal and non-fatal errors.
    Error,
    /// Conditions likely to cause problems.
    Warning,
    /// Informational status messages.
    #[default]
    Info,
    /// Verbose debugging of daemon internals.
    Debug,
    /// Extremely verbose tracing, including per-instruction detail.
    Trace,
}

impl LogLevel {
    /// Canonical textual name of this level, as accepted in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// The `tracing` filter corresponding to this level.
    pub fn filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warning => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a log level name is not recognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseLogLevelError;

impl fmt::Display for ParseLogLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            "Invalid log level. Valid levels are: \"trace\", \"debug\", \
             \"info\", \"warning\", and \"error\".",
        )
    }
}

impl std::error::Error for ParseLogLevelError {}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(ParseLogLevelError),
        }
    }
}

/// Installs the global tracing subscriber filtered at the given level.
///
/// Output goes to stderr. `RUST_LOG` may narrow the filter further per
/// module; the configured level is the default directive. Calling this a
/// second time has no effect.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.filter().into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
