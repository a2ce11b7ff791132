//! Write-only transport fanning writes out to a set of subscribers.
//!
//! The owning layer registers subscriber sockets under their user
//! identifiers. Writes and flushes are forwarded to every subscriber; a
//! subscriber whose write fails is evicted on the spot and reported through
//! the external stop callback so the owner can tear down that user.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{Error, Result, Status};

use crate::socket::{Socket, SocketOps};

struct Subscriber {
    id: String,
    socket: Arc<Socket>,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// Handle through which the owning layer manages broadcast membership.
#[derive(Clone)]
pub struct BroadcastHandle {
    subscribers: Subscribers,
}

impl BroadcastHandle {
    /// Subscribes a socket under the given identifier.
    pub fn add(&self, id: impl Into<String>, socket: Arc<Socket>) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.push(Subscriber {
            id: id.into(),
            socket,
        });
    }

    /// Removes the subscriber with the given identifier, if present.
    pub fn remove(&self, id: &str) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    /// Current number of subscribers.
    pub fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// True if no sockets are subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BroadcastOps {
    subscribers: Subscribers,
    on_stop: Box<dyn Fn(&str) + Send + Sync>,
    instruction: Mutex<()>,
}

impl BroadcastOps {
    pub fn new(on_stop: Box<dyn Fn(&str) + Send + Sync>) -> (Self, BroadcastHandle) {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let handle = BroadcastHandle {
            subscribers: Arc::clone(&subscribers),
        };
        (
            Self {
                subscribers,
                on_stop,
                instruction: Mutex::new(()),
            },
            handle,
        )
    }

    /// Applies `operation` to every subscriber, evicting and reporting any
    /// subscriber for which it fails.
    fn for_each(&self, operation: impl Fn(&Socket) -> Result<()>) -> Result<()> {
        let snapshot: Vec<(String, Arc<Socket>)> = {
            let subscribers = lock(&self.subscribers);
            subscribers
                .iter()
                .map(|subscriber| (subscriber.id.clone(), Arc::clone(&subscriber.socket)))
                .collect()
        };

        for (id, socket) in snapshot {
            if operation(&socket).is_err() {
                let mut subscribers = lock(&self.subscribers);
                subscribers.retain(|subscriber| subscriber.id != id);
                drop(subscribers);
                (self.on_stop)(&id);
            }
        }

        Ok(())
    }
}

impl SocketOps for BroadcastOps {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::new(
            Status::NotSupported,
            "Broadcast sockets are write-only",
        ))
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        self.for_each(|socket| socket.write(buf))
    }

    fn flush(&self) -> Result<()> {
        self.for_each(Socket::flush)
    }

    fn select(&self, _timeout: Option<Duration>) -> Result<bool> {
        Err(Error::new(
            Status::NotSupported,
            "Broadcast sockets are write-only",
        ))
    }

    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.instruction)
    }
}

fn lock(subscribers: &Mutex<Vec<Subscriber>>) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn writes_fan_out_to_all_subscribers() {
        let (broadcast, handle) = Socket::broadcast(|_| {});
        let (a, a_out) = Socket::memory();
        let (b, b_out) = Socket::memory();
        handle.add("@user-a", a);
        handle.add("@user-b", b);

        broadcast.write(b"fanout").expect("write");
        broadcast.flush().expect("flush");

        assert_eq!(a_out.output(), b"fanout".to_vec());
        assert_eq!(b_out.output(), b"fanout".to_vec());
    }

    #[test]
    fn failing_subscriber_is_evicted_and_reported() {
        static STOPPED: AtomicUsize = AtomicUsize::new(0);

        let (broadcast, handle) = Socket::broadcast(|id| {
            assert_eq!(id, "@doomed");
            STOPPED.fetch_add(1, Ordering::SeqCst);
        });

        let (healthy, healthy_out) = Socket::memory();
        let (doomed, _doomed_out) = Socket::memory();
        doomed.close().expect("close");

        handle.add("@healthy", healthy);
        handle.add("@doomed", doomed);

        broadcast.write(b"ping").expect("write");

        assert_eq!(STOPPED.load(Ordering::SeqCst), 1);
        assert_eq!(handle.len(), 1);
        assert_eq!(healthy_out.output(), b"ping".to_vec());
    }

    #[test]
    fn reads_are_not_supported() {
        let (broadcast, _handle) = Socket::broadcast(|_| {});
        let mut buf = [0u8; 4];
        let err = broadcast.read(&mut buf).expect_err("read");
        assert_eq!(err.status(), Status::NotSupported);
    }

    #[test]
    fn membership_can_be_removed_explicitly() {
        let (_broadcast, handle) = Socket::broadcast(|_| {});
        let (socket, _out) = Socket::memory();
        handle.add("@user", socket);
        assert!(!handle.is_empty());
        assert!(handle.remove("@user"));
        assert!(!handle.remove("@user"));
        assert!(handle.is_empty());
    }
}
