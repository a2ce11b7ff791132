//! Listener setup and process-level plumbing.
//!
//! Binding happens before daemonization so configuration errors surface on
//! the controlling terminal; listening and accepting happen after. The
//! daemon requires `SIGPIPE` ignored (writes to closed sockets must fail,
//! not kill the process) and `SIGCHLD` ignored (worker processes must not
//! linger as zombies).

use std::fs::OpenOptions;
use std::net::{TcpListener, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::path::Path;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tracing::{debug, error};

use common::{Error, Result, Status};

/// A socket bound to the configured address but not yet listening.
#[derive(Debug)]
pub struct BoundListener {
    socket: RawSocket,
    /// The address actually bound, for logging.
    pub local_addr: String,
}

/// Resolves the configured host/port and binds the first address that
/// accepts the socket.
pub fn bind(host: &str, port: &str) -> Result<BoundListener> {
    let addresses = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|err| {
            Error::new(
                Status::InvalidArgument,
                format!("Error parsing given address or port: {err}"),
            )
        })?;

    let mut last_error = None;
    for address in addresses {
        let domain = if address.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = match RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(err) => {
                last_error = Some(err);
                continue;
            }
        };

        if let Err(err) = socket.set_reuse_address(true) {
            debug!("Unable to set socket options for reuse: {err}");
        }

        match socket.bind(&address.into()) {
            Ok(()) => {
                debug!("Successfully bound socket to {address}");
                return Ok(BoundListener {
                    socket,
                    local_addr: address.to_string(),
                });
            }
            Err(err) => {
                debug!("Unable to bind socket to {address}: {err}");
                last_error = Some(err);
            }
        }
    }

    Err(match last_error {
        Some(err) => Error::from(err),
        None => Error::new(Status::NotFound, "Unable to bind socket to any addresses"),
    })
}

impl BoundListener {
    /// Starts listening, converting into a standard listener for the
    /// accept loop.
    pub fn listen(self) -> Result<TcpListener> {
        self.socket.listen(5)?;
        Ok(self.socket.into())
    }
}

/// Ignores `SIGPIPE` and `SIGCHLD` process-wide.
pub fn ignore_signals() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    // SAFETY: installing SIG_IGN replaces no Rust-side handler state and
    // is performed once, before any worker or connection thread starts.
    unsafe {
        if signal(Signal::SIGPIPE, SigHandler::SigIgn).is_err() {
            error!(
                "Could not set handler for SIGPIPE to ignore. SIGPIPE may \
                 cause termination of the daemon."
            );
        }
        if signal(Signal::SIGCHLD, SigHandler::SigIgn).is_err() {
            error!(
                "Could not set handler for SIGCHLD to ignore. Worker \
                 processes may pile up in the process table."
            );
        }
    }
}

/// Writes the daemon's PID file, overwriting any existing file.
pub fn write_pidfile(path: &Path) -> Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Detaches from the controlling terminal: double fork with an intervening
/// `setsid`, working directory moved to `/`, and standard descriptors
/// redirected to `/dev/null`. On success only the daemonized grandchild
/// returns.
pub fn daemonize() -> Result<()> {
    use nix::unistd::{ForkResult, chdir, fork, setsid};

    // SAFETY: called once at startup before any thread is spawned; the
    // child only continues normal single-threaded execution.
    match unsafe { fork() }.map_err(|errno| Error::from(std::io::Error::from(errno)))? {
        ForkResult::Parent { child } => {
            debug!("Exiting and passing control to PID {child}");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    let _ = setsid();

    // SAFETY: as above; the session leader forks once more so the daemon
    // can never reacquire a controlling terminal.
    match unsafe { fork() }.map_err(|errno| Error::from(std::io::Error::from(errno)))? {
        ForkResult::Parent { child } => {
            debug!("Exiting and passing control to PID {child}");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    chdir("/").map_err(|errno| Error::from(std::io::Error::from(errno)))?;

    redirect_stdio_to_dev_null()
}

fn redirect_stdio_to_dev_null() -> Result<()> {
    use nix::unistd::dup2;

    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let null_fd = dev_null.as_raw_fd();

    for target in 0..=2 {
        dup2(null_fd, target).map_err(|errno| Error::from(std::io::Error::from(errno)))?;
    }
    Ok(())
}
