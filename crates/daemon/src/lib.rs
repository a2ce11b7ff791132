//! The Guacamole proxy daemon.
//!
//! Accepts display-protocol connections from web clients and, on their
//! behalf, spawns and multiplexes backend protocol workers. This crate
//! holds everything above the codec and transport layers: configuration,
//! the connection router, the worker registry, the descriptor-passing
//! channel, and the listener loop.

pub mod conf;
pub mod connection;
pub mod move_fd;
pub mod net;
pub mod proc;
pub mod proc_map;

use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use crate::conf::Config;
use crate::connection::Router;
use crate::proc::ExecSpawner;
use crate::proc_map::ProcMap;

/// Exit status for a clean shutdown.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit status for configuration errors and fatal startup failures.
pub const EXIT_FAILURE: u8 = 1;

/// Exit status for listen/accept failures after daemonization.
pub const EXIT_LISTEN_FAILURE: u8 = 3;

/// Runs the daemon with the given command-line arguments, returning its
/// exit status.
pub fn run<I, T>(args: I) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    /* Configuration file first, then command-line overrides */
    let mut config = match conf::load_default() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_FAILURE;
        }
    };
    if let Err(message) = conf::args::apply(&mut config, args) {
        eprintln!("{message}");
        return EXIT_FAILURE;
    }

    if config.print_version {
        println!("Guacamole proxy daemon (guacd) version {}", version());
        return EXIT_SUCCESS;
    }

    logging::init(config.max_log_level);
    serve(&config)
}

/// Brings the daemon up around a validated configuration and runs the
/// accept loop.
fn serve(config: &Config) -> u8 {
    info!(
        "Guacamole proxy daemon (guacd) version {} started",
        version()
    );

    /* Bind before daemonizing so address errors reach the terminal */
    let bound = match net::bind(&config.bind_host, &config.bind_port) {
        Ok(bound) => bound,
        Err(err) => {
            error!("{err}");
            return EXIT_FAILURE;
        }
    };

    let tls = match load_tls(config) {
        Ok(tls) => tls,
        Err(status) => return status,
    };

    if !config.foreground {
        if let Err(err) = net::daemonize() {
            error!("Could not become a daemon: {err}");
            return EXIT_FAILURE;
        }
    }

    if let Some(pidfile) = &config.pidfile {
        if let Err(err) = net::write_pidfile(pidfile) {
            error!("Could not write PID file: {err}");
            return EXIT_FAILURE;
        }
    }

    net::ignore_signals();

    info!("Listening on {}", bound.local_addr);
    let listener = match bound.listen() {
        Ok(listener) => listener,
        Err(err) => {
            error!("Could not listen on socket: {err}");
            return EXIT_LISTEN_FAILURE;
        }
    };

    let router = Arc::new(Router::new(
        Arc::new(ProcMap::new()),
        Arc::new(ExecSpawner::new(None)),
        tls,
    ));

    accept_loop(&listener, &router)
}

/// Accepts connections forever, spawning one router thread per client.
fn accept_loop(listener: &std::net::TcpListener, router: &Arc<Router>) -> u8 {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _peer)) => stream,
            Err(err) => {
                error!("Could not accept client connection: {err}");
                continue;
            }
        };

        let router = Arc::clone(router);
        let spawned = std::thread::Builder::new()
            .name("guac-connection".into())
            .spawn(move || router.handle_connection(stream));
        if let Err(err) = spawned {
            error!("Could not create connection thread: {err}");
        }
    }
}

fn load_tls(config: &Config) -> Result<Option<transport::TlsAcceptor>, u8> {
    if !config.tls_enabled() {
        return Ok(None);
    }

    info!("Communication will require TLS.");
    let (Some(cert_file), Some(key_file)) = (&config.cert_file, &config.key_file) else {
        error!("TLS requires both a certificate file and a key file.");
        return Err(EXIT_FAILURE);
    };

    match transport::load_server_config(cert_file, key_file) {
        Ok(server_config) => Ok(Some(transport::TlsAcceptor::new(server_config))),
        Err(err) => {
            error!("Unable to initialize TLS: {err}");
            Err(EXIT_FAILURE)
        }
    }
}

/// The daemon's version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Maps a [`run`] status onto a process exit code.
pub fn exit_code_from(status: u8) -> ExitCode {
    ExitCode::from(status)
}
