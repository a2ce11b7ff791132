//! Reentrant reader/writer lock.
//!
//! Wraps a raw reader/writer primitive with per-thread bookkeeping so that a
//! thread which already holds the lock may acquire it again without
//! deadlocking. The per-thread state is a single machine word: the
//! least-significant nibble records which lock is held (none, read, or
//! write) and the remaining bits count the acquisition depth.
//!
//! Upgrading a held read lock to a write lock is refused with
//! [`Status::NotSupported`]: releasing the read lock to acquire the write
//! lock would open a window in which other writers can mutate state the
//! reader believes is stable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;

use crate::error::{Error, Result};
use crate::status::Status;

/// No lock is held by the current thread.
const MODE_NONE: usize = 0;

/// The current thread holds the read lock.
const MODE_READ: usize = 1;

/// The current thread holds the write lock.
const MODE_WRITE: usize = 2;

/// Maximum depth storable beside the 4-bit mode nibble.
const MAX_DEPTH: usize = usize::MAX >> 4;

thread_local! {
    /// Per-thread packed mode/depth words, keyed by lock identity.
    static HELD: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

fn pack(mode: usize, depth: usize) -> usize {
    (mode & 0xF) | (depth << 4)
}

fn mode_of(word: usize) -> usize {
    word & 0xF
}

fn depth_of(word: usize) -> usize {
    word >> 4
}

/// A reader/writer lock which the holding thread may re-acquire.
pub struct ReentrantRwLock {
    raw: RawRwLock,
    id: usize,
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantRwLock {
    /// Creates a new, unlocked lock.
    pub fn new() -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
        Self {
            raw: RawRwLock::INIT,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn state(&self) -> usize {
        HELD.with(|held| held.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn set_state(&self, word: usize) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if word == 0 {
                held.remove(&self.id);
            } else {
                held.insert(self.id, word);
            }
        });
    }

    /// Acquires the lock for reading, or deepens an existing hold.
    pub fn acquire_read(&self) -> Result<()> {
        let word = self.state();
        let mode = mode_of(word);
        let depth = depth_of(word);

        if depth >= MAX_DEPTH {
            return Err(Error::new(
                Status::TooMany,
                "Unable to acquire read lock because there's insufficient \
                 space to store another level of lock depth",
            ));
        }

        /* The current thread may read if it holds either lock already */
        if mode == MODE_READ || mode == MODE_WRITE {
            self.set_state(pack(mode, depth + 1));
            return Ok(());
        }

        debug_assert_eq!(mode, MODE_NONE);
        self.raw.lock_shared();
        self.set_state(pack(MODE_READ, 1));
        Ok(())
    }

    /// Acquires the lock for writing, or deepens an existing write hold.
    ///
    /// Fails with [`Status::NotSupported`] if the current thread holds the
    /// read lock: upgrades are not atomic and are refused outright.
    pub fn acquire_write(&self) -> Result<()> {
        let word = self.state();
        let mode = mode_of(word);
        let depth = depth_of(word);

        if depth >= MAX_DEPTH {
            return Err(Error::new(
                Status::TooMany,
                "Unable to acquire write lock because there's insufficient \
                 space to store another level of lock depth",
            ));
        }

        if mode == MODE_WRITE {
            self.set_state(pack(MODE_WRITE, depth + 1));
            return Ok(());
        }

        if mode == MODE_READ {
            return Err(Error::new(
                Status::NotSupported,
                "Upgrading a held read lock to a write lock is not supported",
            ));
        }

        debug_assert_eq!(mode, MODE_NONE);
        self.raw.lock_exclusive();
        self.set_state(pack(MODE_WRITE, 1));
        Ok(())
    }

    /// Releases one level of the current thread's hold on the lock.
    ///
    /// The underlying primitive is released only when the depth returns to
    /// zero. Fails with [`Status::InvalidArgument`] if the current thread
    /// holds no lock.
    pub fn release(&self) -> Result<()> {
        let word = self.state();
        let mode = mode_of(word);
        let depth = depth_of(word);

        if depth == 0 {
            return Err(Error::new(
                Status::InvalidArgument,
                "Unable to release lock because it's not held by the current thread",
            ));
        }

        if depth == 1 {
            match mode {
                MODE_READ => unsafe { self.raw.unlock_shared() },
                MODE_WRITE => unsafe { self.raw.unlock_exclusive() },
                _ => {
                    return Err(Error::new(
                        Status::InternalError,
                        "Lock depth recorded without a lock mode",
                    ));
                }
            }
            self.set_state(0);
            return Ok(());
        }

        self.set_state(pack(mode, depth - 1));
        Ok(())
    }

    /// Forces the per-thread word to a given mode and depth without touching
    /// the underlying primitive. Depth-overflow paths are unreachable by
    /// honest acquisition, so tests seed them directly.
    #[cfg(test)]
    fn seed_state_for_test(&self, mode: usize, depth: usize) {
        self.set_state(pack(mode, depth));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_lock_is_reentrant_and_counts_releases() {
        let lock = ReentrantRwLock::new();

        for _ in 0..5 {
            lock.acquire_read().expect("read acquisition");
        }

        /* Four releases keep the lock held for reading */
        for _ in 0..4 {
            lock.release().expect("partial release");
        }

        /* A writer on another thread must still block */
        let lock = Arc::new(lock);
        let contender = Arc::clone(&lock);
        let (tx, rx) = mpsc::channel();
        let writer = thread::spawn(move || {
            contender.acquire_write().expect("write acquisition");
            tx.send(()).expect("send");
            contender.release().expect("write release");
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "writer acquired lock while a read hold remained"
        );

        lock.release().expect("final release");
        rx.recv_timeout(Duration::from_secs(5))
            .expect("writer never acquired the lock");
        writer.join().expect("writer thread");
    }

    #[test]
    fn write_lock_is_reentrant() {
        let lock = ReentrantRwLock::new();
        lock.acquire_write().expect("write acquisition");
        lock.acquire_write().expect("reentrant write acquisition");
        lock.acquire_read().expect("read under write");
        lock.release().expect("release");
        lock.release().expect("release");
        lock.release().expect("release");

        /* Fully released: the next release must fail */
        let err = lock.release().expect_err("over-release");
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn release_without_hold_is_invalid() {
        let lock = ReentrantRwLock::new();
        let err = lock.release().expect_err("release without acquire");
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn upgrade_from_read_is_refused() {
        let lock = ReentrantRwLock::new();
        lock.acquire_read().expect("read acquisition");
        let err = lock.acquire_write().expect_err("upgrade");
        assert_eq!(err.status(), Status::NotSupported);
        lock.release().expect("release");
    }

    #[test]
    fn depth_overflow_is_reported_without_touching_the_primitive() {
        let lock = ReentrantRwLock::new();
        lock.seed_state_for_test(MODE_READ, MAX_DEPTH);

        let err = lock.acquire_read().expect_err("overflowing read");
        assert_eq!(err.status(), Status::TooMany);

        let err = lock.acquire_write().expect_err("overflowing write");
        assert_eq!(err.status(), Status::TooMany);

        lock.seed_state_for_test(MODE_NONE, 0);
    }

    #[test]
    fn packed_word_roundtrips() {
        let word = pack(MODE_WRITE, 1234);
        assert_eq!(mode_of(word), MODE_WRITE);
        assert_eq!(depth_of(word), 1234);
    }
}
