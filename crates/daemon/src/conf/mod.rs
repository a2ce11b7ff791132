//! Daemon configuration: defaults, config file, command-line overrides.

pub mod args;
mod parse;

use std::fmt;
use std::path::{Path, PathBuf};

use logging::LogLevel;

pub use parse::ConfParseError;

/// Default path of the daemon configuration file.
pub const DEFAULT_CONF_FILE: &str = "/etc/guacamole/guacd.conf";

/// Default listening address.
pub const DEFAULT_BIND_HOST: &str = "localhost";

/// Default listening port.
pub const DEFAULT_BIND_PORT: &str = "4822";

/// Immutable daemon configuration, built once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Address the listener binds to.
    pub bind_host: String,
    /// Port the listener binds to.
    pub bind_port: String,
    /// Path of the PID file to write, if any.
    pub pidfile: Option<PathBuf>,
    /// Whether to stay in the foreground rather than daemonize.
    pub foreground: bool,
    /// Whether to print the version and exit.
    pub print_version: bool,
    /// Maximum severity of emitted log messages.
    pub max_log_level: LogLevel,
    /// TLS certificate chain file, if TLS is enabled.
    pub cert_file: Option<PathBuf>,
    /// TLS private key file, if TLS is enabled.
    pub key_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_owned(),
            bind_port: DEFAULT_BIND_PORT.to_owned(),
            pidfile: None,
            foreground: false,
            print_version: false,
            max_log_level: LogLevel::Info,
            cert_file: None,
            key_file: None,
        }
    }
}

impl Config {
    /// True if TLS termination is configured.
    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some()
    }
}

/// Failure to load the configuration file.
#[derive(Debug)]
pub enum ConfError {
    /// The file exists but could not be read.
    Io(std::io::Error),
    /// The file could not be parsed.
    Parse(ConfParseError),
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Error reading configuration: {err}"),
            Self::Parse(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ConfError {}

/// Applies one parsed parameter to the configuration.
fn apply_param(
    config: &mut Config,
    section: &str,
    param: &str,
    value: &str,
) -> Result<(), String> {
    match (section, param) {
        ("server", "bind_host") => {
            config.bind_host = value.to_owned();
            Ok(())
        }
        ("server", "bind_port") => {
            config.bind_port = value.to_owned();
            Ok(())
        }
        ("daemon", "pid_file") => {
            config.pidfile = Some(PathBuf::from(value));
            Ok(())
        }
        ("daemon", "log_level") => {
            config.max_log_level = value
                .parse::<LogLevel>()
                .map_err(|err| err.to_string())?;
            Ok(())
        }
        ("ssl", "server_certificate") => {
            config.cert_file = Some(PathBuf::from(value));
            Ok(())
        }
        ("ssl", "server_key") => {
            config.key_file = Some(PathBuf::from(value));
            Ok(())
        }
        _ => Err("Invalid parameter or section name".into()),
    }
}

/// Loads configuration from the given file. A missing file is not an
/// error; defaults are returned.
pub fn load(path: &Path) -> Result<Config, ConfError> {
    let mut config = Config::default();

    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(config),
        Err(err) => return Err(ConfError::Io(err)),
    };

    parse::parse(&data, &mut |section, param, value| {
        apply_param(&mut config, section, param, value)
    })
    .map_err(ConfError::Parse)?;

    Ok(config)
}

/// Loads configuration from the default file location.
pub fn load_default() -> Result<Config, ConfError> {
    load(Path::new(DEFAULT_CONF_FILE))
}
