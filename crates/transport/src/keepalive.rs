//! Background keep-alive pings for idle sockets.
//!
//! Once armed, a socket emits a `nop` instruction whenever no write has
//! occurred for a full interval, keeping intermediaries from dropping the
//! connection. The task holds only a weak reference to its socket and
//! terminates cooperatively: closing the socket (or dropping it) signals a
//! token that the task observes between bounded waits.

use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::NOP_INSTRUCTION;
use crate::socket::Socket;

/// A running keep-alive task bound to one socket.
pub(crate) struct KeepAlive {
    token: Arc<StopToken>,
    handle: Option<JoinHandle<()>>,
}

struct StopToken {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl StopToken {
    /// Waits for the given duration, returning early with `true` once the
    /// token has been signaled.
    fn wait(&self, duration: Duration) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = std::time::Instant::now() + duration;
        while !*stopped {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _result) = self
                .signal
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        true
    }

    fn signal(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.signal.notify_all();
    }
}

impl KeepAlive {
    /// Starts the keep-alive task for the given socket.
    pub(crate) fn spawn(socket: Weak<Socket>, interval: Duration) -> Self {
        let token = Arc::new(StopToken {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        });
        let task_token = Arc::clone(&token);

        let handle = std::thread::Builder::new()
            .name("guac-keepalive".into())
            .spawn(move || run(&socket, interval, &task_token))
            .expect("spawn keep-alive thread");

        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Signals the task to stop and waits for it to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.signal();
        if let Some(handle) = self.handle.take() {
            /* The final reference to a socket may be released by the task
             * itself; joining from there would deadlock on our own thread */
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(socket: &Weak<Socket>, interval: Duration, token: &StopToken) {
    loop {
        if token.wait(interval) {
            return;
        }

        let Some(socket) = socket.upgrade() else {
            return;
        };
        if !socket.is_open() {
            return;
        }

        /* Ping only when a full interval has passed without output */
        if socket.idle_micros() >= interval.as_micros() as u64 {
            if socket.write(NOP_INSTRUCTION).is_err() || socket.flush().is_err() {
                tracing::debug!("Keep-alive ping failed; stopping");
                return;
            }
        }
    }
}
