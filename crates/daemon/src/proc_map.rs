//! Registry of running workers, keyed by connection identifier.
//!
//! A fixed array of independently locked hash buckets holds the workers; a
//! parallel list of all workers supports whole-map iteration under a
//! single short lock. No lock is ever held across I/O.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::{Error, Result, Status};

use crate::proc::Worker;

/// Maximum number of concurrently tracked workers the bucket count is
/// sized for.
pub const MAX_WORKERS: usize = 256;

/// Number of hash buckets; at least twice the supported worker count so
/// chains stay short.
const BUCKET_COUNT: usize = MAX_WORKERS * 2;

/// Concurrent map from connection identifier to worker handle.
pub struct ProcMap {
    buckets: Vec<Mutex<Vec<Arc<Worker>>>>,
    /// Every registered worker, in registration order, for iteration.
    all: Mutex<Vec<Arc<Worker>>>,
}

impl Default for ProcMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulator hash over the identifier bytes.
fn hash(id: &str) -> u32 {
    let mut value: u32 = 0;
    for &byte in id.as_bytes() {
        value = value.wrapping_mul(65599).wrapping_add(u32::from(byte));
    }
    value
}

impl ProcMap {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            all: Mutex::new(Vec::new()),
        }
    }

    fn bucket(&self, id: &str) -> MutexGuard<'_, Vec<Arc<Worker>>> {
        let index = hash(id) as usize % BUCKET_COUNT;
        self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn all(&self) -> MutexGuard<'_, Vec<Arc<Worker>>> {
        self.all.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a worker under its connection identifier.
    ///
    /// Fails if a worker with the same identifier is already registered.
    pub fn add(&self, worker: Arc<Worker>) -> Result<()> {
        let id = worker.connection_id();
        let mut bucket = self.bucket(id);

        if bucket
            .iter()
            .any(|existing| existing.connection_id() == id)
        {
            return Err(Error::new(
                Status::Busy,
                "Connection identifier already registered",
            ));
        }

        self.all().push(Arc::clone(&worker));
        bucket.push(worker);
        Ok(())
    }

    /// Looks up the worker registered under the given identifier.
    pub fn retrieve(&self, id: &str) -> Option<Arc<Worker>> {
        let bucket = self.bucket(id);
        bucket
            .iter()
            .find(|worker| worker.connection_id() == id)
            .map(Arc::clone)
    }

    /// Removes and returns the worker registered under the given
    /// identifier.
    pub fn remove(&self, id: &str) -> Option<Arc<Worker>> {
        let mut bucket = self.bucket(id);
        let position = bucket
            .iter()
            .position(|worker| worker.connection_id() == id)?;
        let worker = bucket.remove(position);

        let mut all = self.all();
        if let Some(index) = all.iter().position(|entry| Arc::ptr_eq(entry, &worker)) {
            all.remove(index);
        }

        Some(worker)
    }

    /// Invokes the callback for every registered worker, holding the
    /// iteration lock for the duration. The callback must not re-enter the
    /// registry.
    pub fn for_each(&self, mut callback: impl FnMut(&Arc<Worker>)) {
        let all = self.all();
        for worker in all.iter() {
            callback(worker);
        }
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.all().len()
    }

    /// True if no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ClientSkeleton;
    use common::id;
    use nix::unistd::Pid;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn test_worker(connection_id: &str) -> Arc<Worker> {
        let (ours, _theirs) = UnixStream::pair().expect("socketpair");
        Arc::new(Worker::new(
            Pid::from_raw(0),
            ours,
            ClientSkeleton {
                connection_id: connection_id.to_owned(),
                protocol: "test".into(),
            },
        ))
    }

    #[test]
    fn add_then_retrieve_returns_the_same_worker() {
        let map = ProcMap::new();
        let id = id::generate(id::WORKER_PREFIX);
        let worker = test_worker(&id);

        map.add(Arc::clone(&worker)).expect("add");
        let found = map.retrieve(&id).expect("retrieve");
        assert!(Arc::ptr_eq(&worker, &found));
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let map = ProcMap::new();
        let id = id::generate(id::WORKER_PREFIX);

        map.add(test_worker(&id)).expect("first add");
        let err = map.add(test_worker(&id)).expect_err("duplicate add");
        assert_eq!(err.status(), Status::Busy);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn concurrent_duplicate_adds_admit_exactly_one() {
        let map = Arc::new(ProcMap::new());
        let id = id::generate(id::WORKER_PREFIX);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let worker = test_worker(&id);
                thread::spawn(move || map.add(worker).is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|&ok| ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_returns_the_registered_worker_and_clears_it() {
        let map = ProcMap::new();
        let id = id::generate(id::WORKER_PREFIX);
        let worker = test_worker(&id);

        map.add(Arc::clone(&worker)).expect("add");
        let removed = map.remove(&id).expect("remove");
        assert!(Arc::ptr_eq(&worker, &removed));

        assert!(map.retrieve(&id).is_none());
        assert!(map.remove(&id).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn for_each_visits_every_worker_in_registration_order() {
        let map = ProcMap::new();
        let ids: Vec<String> = (0..5).map(|_| id::generate(id::WORKER_PREFIX)).collect();
        for id in &ids {
            map.add(test_worker(id)).expect("add");
        }

        let mut seen = Vec::new();
        map.for_each(|worker| seen.push(worker.connection_id().to_owned()));
        assert_eq!(seen, ids);
    }

    #[test]
    fn hash_distributes_identifiers() {
        /* The accumulator hash must at least distinguish realistic IDs */
        let a = hash("$aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        let b = hash("$aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeef");
        assert_ne!(a, b);
    }
}
