//! Worker process handles and the spawn interface.
//!
//! A worker is a backend protocol process, opaque to the daemon core. The
//! daemon holds only its process identifier, the UNIX-domain channel used
//! to pass newly accepted client descriptors into it, and a skeleton client
//! record carrying the connection identifier. Spawning is delegated to a
//! [`Spawner`]; the daemon ships an exec-based spawner that launches one
//! plugin executable per protocol.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use common::{Error, Result, Status, id};

use crate::move_fd;

/// Descriptor number at which a plugin executable receives its end of the
/// descriptor-passing channel.
pub const PLUGIN_CHANNEL_FD: i32 = 3;

/// Skeleton client record shared between the daemon and a worker.
///
/// The daemon side never holds protocol state; it carries only what
/// routing and logging need.
#[derive(Clone, Debug)]
pub struct ClientSkeleton {
    /// The identifier under which users join this connection.
    pub connection_id: String,
    /// The backend protocol this worker speaks.
    pub protocol: String,
}

impl ClientSkeleton {
    /// Logging span naming this connection; worker-related diagnostics are
    /// emitted inside it.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("connection", id = %self.connection_id)
    }
}

/// Handle to a running worker process.
#[derive(Debug)]
pub struct Worker {
    pid: Pid,
    channel: UnixStream,
    client: ClientSkeleton,
}

impl Worker {
    /// Builds a handle from a spawned process and its descriptor channel.
    pub fn new(pid: Pid, channel: UnixStream, client: ClientSkeleton) -> Self {
        Self {
            pid,
            channel,
            client,
        }
    }

    /// The identifier under which this worker is registered.
    pub fn connection_id(&self) -> &str {
        &self.client.connection_id
    }

    /// The skeleton client record for this worker.
    pub fn client(&self) -> &ClientSkeleton {
        &self.client
    }

    /// The worker's process identifier.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Passes an accepted user's descriptor into the worker.
    pub fn send_user_fd(&self, fd: BorrowedFd<'_>) -> Result<()> {
        move_fd::send_fd(&self.channel, fd)
    }

    /// Blocks until the worker process terminates.
    ///
    /// With `SIGCHLD` ignored the kernel reaps children itself and reports
    /// `ECHILD` once the process is gone; that counts as termination.
    pub fn wait(&self) -> Result<()> {
        match waitpid(self.pid, None) {
            Ok(_) | Err(Errno::ECHILD) => Ok(()),
            Err(errno) => Err(Error::from(std::io::Error::from(errno))),
        }
    }

    /// Signals the worker to stop accepting users and shut down.
    pub fn stop(&self) {
        if let Err(errno) = kill(self.pid, Signal::SIGTERM) {
            if errno != Errno::ESRCH {
                tracing::warn!(
                    "Unable to signal worker {}: {}",
                    self.client.connection_id,
                    errno
                );
            }
        }
    }
}

/// Factory creating a worker for a requested protocol.
pub trait Spawner: Send + Sync {
    /// Spawns a worker whose descriptor channel is ready for immediate
    /// use.
    fn spawn(&self, protocol: &str) -> Result<Worker>;
}

/// Spawner launching one plugin executable per protocol.
///
/// The executable `guacd-<protocol>` is looked up in the configured plugin
/// directory (or `PATH` when none is set) and receives its end of the
/// descriptor channel on descriptor 3, with the connection identifier in
/// the `GUACD_CONNECTION_ID` environment variable.
pub struct ExecSpawner {
    plugin_dir: Option<PathBuf>,
}

impl ExecSpawner {
    pub fn new(plugin_dir: Option<PathBuf>) -> Self {
        Self { plugin_dir }
    }

    fn plugin_path(&self, protocol: &str) -> PathBuf {
        let binary = format!("guacd-{protocol}");
        match &self.plugin_dir {
            Some(dir) => dir.join(binary),
            None => PathBuf::from(binary),
        }
    }
}

impl Spawner for ExecSpawner {
    fn spawn(&self, protocol: &str) -> Result<Worker> {
        /* Reject protocol names that could escape the plugin directory */
        if protocol.is_empty()
            || !protocol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::new(
                Status::InvalidArgument,
                "Invalid protocol name",
            ));
        }

        let (ours, theirs) = UnixStream::pair()?;
        let connection_id = id::generate(id::WORKER_PREFIX);

        let mut command = Command::new(self.plugin_path(protocol));
        command.env("GUACD_CONNECTION_ID", &connection_id);

        let channel_fd = theirs.as_raw_fd();
        // SAFETY: dup2 and close are async-signal-safe; the duplicated
        // descriptor stays open across exec because dup2 clears FD_CLOEXEC.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(channel_fd, PLUGIN_CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        drop(theirs);

        Ok(Worker::new(
            Pid::from_raw(child.id() as i32),
            ours,
            ClientSkeleton {
                connection_id,
                protocol: protocol.to_owned(),
            },
        ))
    }
}
