//! In-memory transport.
//!
//! Reads are served from a queue of scripted chunks and block until data or
//! end-of-input arrives; writes accumulate in a shared buffer. Tests use
//! this variant to feed the parser byte-at-a-time and to capture framed
//! output without touching a descriptor.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Result;

use crate::socket::SocketOps;

struct Input {
    chunks: VecDeque<Vec<u8>>,
    finished: bool,
}

struct Shared {
    input: Mutex<Input>,
    available: Condvar,
    output: Mutex<Vec<u8>>,
}

/// Handle scripting an in-memory socket's input and observing its output.
#[derive(Clone)]
pub struct MemHandle {
    shared: Arc<Shared>,
}

impl MemHandle {
    /// Queues one chunk of input; each chunk is surfaced by a single read.
    pub fn push(&self, bytes: &[u8]) {
        let mut input = lock(&self.shared.input);
        input.chunks.push_back(bytes.to_vec());
        self.shared.available.notify_all();
    }

    /// Queues input one byte per chunk, forcing byte-at-a-time reads.
    pub fn push_bytewise(&self, bytes: &[u8]) {
        let mut input = lock(&self.shared.input);
        for &byte in bytes {
            input.chunks.push_back(vec![byte]);
        }
        self.shared.available.notify_all();
    }

    /// Marks the end of input; subsequent reads observe end-of-stream.
    pub fn finish(&self) {
        let mut input = lock(&self.shared.input);
        input.finished = true;
        self.shared.available.notify_all();
    }

    /// Snapshot of everything written to the socket so far.
    pub fn output(&self) -> Vec<u8> {
        lock(&self.shared.output).clone()
    }

    /// Removes and returns everything written to the socket so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.shared.output))
    }
}

pub struct MemOps {
    shared: Arc<Shared>,
    instruction: Mutex<()>,
}

impl MemOps {
    pub fn new() -> (Self, MemHandle) {
        let shared = Arc::new(Shared {
            input: Mutex::new(Input {
                chunks: VecDeque::new(),
                finished: false,
            }),
            available: Condvar::new(),
            output: Mutex::new(Vec::new()),
        });
        let handle = MemHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                instruction: Mutex::new(()),
            },
            handle,
        )
    }
}

impl SocketOps for MemOps {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut input = lock(&self.shared.input);

        while input.chunks.is_empty() {
            if input.finished {
                return Ok(0);
            }
            input = self
                .shared
                .available
                .wait(input)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let mut chunk = input.chunks.pop_front().expect("non-empty queue");
        if chunk.len() > buf.len() {
            /* Surface what fits and requeue the remainder */
            let remainder = chunk.split_off(buf.len());
            input.chunks.push_front(remainder);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        lock(&self.shared.output).extend_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn select(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut input = lock(&self.shared.input);

        match timeout {
            None => {
                while input.chunks.is_empty() && !input.finished {
                    input = self
                        .shared
                        .available
                        .wait(input)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Ok(true)
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while input.chunks.is_empty() && !input.finished {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (guard, _result) = self
                        .shared
                        .available
                        .wait_timeout(input, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    input = guard;
                }
                Ok(true)
            }
        }
    }

    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.instruction)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
