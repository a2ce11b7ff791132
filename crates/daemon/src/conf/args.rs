//! Command-line flags overriding the configuration file.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

use logging::LogLevel;

use super::Config;

/// Usage line printed when argument parsing fails.
pub const USAGE: &str = "USAGE: guacd [-l LISTENPORT] [-b LISTENADDRESS] [-p PIDFILE] \
                         [-L LEVEL] [-C CERTIFICATE_FILE] [-K PEM_FILE] [-f] [-v]";

fn command() -> Command {
    Command::new("guacd")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(Arg::new("bind_port").short('l').value_name("LISTENPORT"))
        .arg(Arg::new("bind_host").short('b').value_name("LISTENADDRESS"))
        .arg(Arg::new("pidfile").short('p').value_name("PIDFILE"))
        .arg(Arg::new("log_level").short('L').value_name("LEVEL"))
        .arg(Arg::new("cert_file").short('C').value_name("CERTIFICATE_FILE"))
        .arg(Arg::new("key_file").short('K').value_name("PEM_FILE"))
        .arg(
            Arg::new("foreground")
                .short('f')
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("version").short('v').action(ArgAction::SetTrue))
}

/// Applies command-line flags on top of the file-derived configuration.
///
/// Returns the message to print before exiting with status 1 when the
/// arguments are invalid.
pub fn apply<I, T>(config: &mut Config, args: I) -> Result<(), String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command()
        .try_get_matches_from(args)
        .map_err(|_| USAGE.to_owned())?;

    if let Some(port) = matches.get_one::<String>("bind_port") {
        config.bind_port = port.clone();
    }
    if let Some(host) = matches.get_one::<String>("bind_host") {
        config.bind_host = host.clone();
    }
    if let Some(pidfile) = matches.get_one::<String>("pidfile") {
        config.pidfile = Some(PathBuf::from(pidfile));
    }
    if let Some(level) = matches.get_one::<String>("log_level") {
        config.max_log_level = level
            .parse::<LogLevel>()
            .map_err(|err| err.to_string())?;
    }
    if let Some(cert) = matches.get_one::<String>("cert_file") {
        config.cert_file = Some(PathBuf::from(cert));
    }
    if let Some(key) = matches.get_one::<String>("key_file") {
        config.key_file = Some(PathBuf::from(key));
    }
    if matches.get_flag("foreground") {
        config.foreground = true;
    }
    if matches.get_flag("version") {
        config.print_version = true;
    }

    Ok(())
}
