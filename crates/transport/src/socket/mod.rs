//! The socket abstraction shared by every transport variant.
//!
//! A [`Socket`] pairs a variant-specific backend (the [`SocketOps`]
//! implementation) with the state common to all variants: the open/closed
//! flag, the last-write timestamp driving keep-alive, and the base64
//! staging buffers. The backend owns buffering and locking appropriate to
//! its medium; the `Socket` owns everything the protocol layer sees.

pub mod broadcast;
pub mod fd;
pub mod mem;
pub mod tee;
pub mod tls;

use std::net::TcpStream;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use common::{Error, Result, Status};

use crate::keepalive::KeepAlive;
use crate::{BASE64_ENCODED_BUFFER_SIZE, BASE64_READY_BUFFER_SIZE, KEEP_ALIVE_INTERVAL};

use broadcast::BroadcastHandle;
use mem::MemHandle;
use tls::TlsAcceptor;

/// Backend operations implemented by each transport variant.
///
/// `write` accepts the entire buffer, buffering internally as appropriate;
/// `read` returns `Ok(0)` at end of stream. `select` resolves to `Ok(true)`
/// when a read will not block, `Ok(false)` when the timeout elapses first
/// (`None` waits indefinitely).
pub trait SocketOps: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, buf: &[u8]) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn select(&self, timeout: Option<Duration>) -> Result<bool>;

    /// The mutex serializing whole instructions on this transport, if the
    /// variant has one. Derived transports may delegate to an underlying
    /// transport's mutex.
    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        None
    }

    /// Variant-specific teardown performed once when the socket closes.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Base64 staging state for the socket's binary sub-stream.
struct Base64 {
    ready: [u8; BASE64_READY_BUFFER_SIZE],
    ready_len: usize,
}

impl Base64 {
    fn new() -> Self {
        Self {
            ready: [0; BASE64_READY_BUFFER_SIZE],
            ready_len: 0,
        }
    }
}

/// RFC 4648 alphabet used by the base64 sub-stream.
const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Encodes a group of one to three bytes as four base64 characters,
/// padding with `=` for missing trailing bytes.
fn encode_base64_group(a: u8, b: Option<u8>, c: Option<u8>, out: &mut [u8]) {
    out[0] = BASE64_ALPHABET[usize::from((a & 0xFC) >> 2)];

    match b {
        Some(b) => {
            out[1] = BASE64_ALPHABET[usize::from(((a & 0x03) << 4) | ((b & 0xF0) >> 4))];
            match c {
                Some(c) => {
                    out[2] = BASE64_ALPHABET[usize::from(((b & 0x0F) << 2) | ((c & 0xC0) >> 6))];
                    out[3] = BASE64_ALPHABET[usize::from(c & 0x3F)];
                }
                None => {
                    out[2] = BASE64_ALPHABET[usize::from((b & 0x0F) << 2)];
                    out[3] = b'=';
                }
            }
        }
        None => {
            out[1] = BASE64_ALPHABET[usize::from((a & 0x03) << 4)];
            out[2] = b'=';
            out[3] = b'=';
        }
    }
}

/// Guard holding a socket's instruction lock for the duration of one
/// instruction. Dropping the guard releases the lock.
pub struct InstructionGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

/// A buffered, lockable byte transport.
pub struct Socket {
    ops: Box<dyn SocketOps>,
    open: AtomicBool,
    /// Microseconds since `epoch` of the most recent write.
    last_write: AtomicU64,
    epoch: Instant,
    base64: Mutex<Base64>,
    keep_alive: Mutex<Option<KeepAlive>>,
}

impl Socket {
    /// Wraps a backend implementation in a socket.
    pub fn from_ops(ops: Box<dyn SocketOps>) -> Arc<Self> {
        Arc::new(Self {
            ops,
            open: AtomicBool::new(true),
            last_write: AtomicU64::new(0),
            epoch: Instant::now(),
            base64: Mutex::new(Base64::new()),
            keep_alive: Mutex::new(None),
        })
    }

    /// Opens a socket over the given file descriptor with buffered writes.
    pub fn open(fd: OwnedFd) -> Arc<Self> {
        Self::from_ops(Box::new(fd::FdOps::new(fd)))
    }

    /// Opens a TLS socket over an accepted TCP connection, performing the
    /// server-side handshake before returning.
    pub fn open_secure(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<Arc<Self>> {
        Ok(Self::from_ops(Box::new(acceptor.accept(stream)?)))
    }

    /// Creates a tee: writes and flushes are duplicated onto `secondary`,
    /// while reads, readiness, and lock scope come from `primary` alone.
    pub fn tee(primary: Arc<Self>, secondary: Arc<Self>) -> Arc<Self> {
        Self::from_ops(Box::new(tee::TeeOps::new(primary, secondary)))
    }

    /// Creates a write-only broadcast socket. Writes are forwarded to every
    /// subscribed socket; a subscriber whose write fails is evicted and
    /// reported through `on_stop`.
    pub fn broadcast(
        on_stop: impl Fn(&str) + Send + Sync + 'static,
    ) -> (Arc<Self>, BroadcastHandle) {
        let (ops, handle) = broadcast::BroadcastOps::new(Box::new(on_stop));
        (Self::from_ops(Box::new(ops)), handle)
    }

    /// Creates an in-memory socket along with a handle for scripting its
    /// input and inspecting its output.
    pub fn memory() -> (Arc<Self>, MemHandle) {
        let (ops, handle) = mem::MemOps::new();
        (Self::from_ops(Box::new(ops)), handle)
    }

    /// True until the socket has been closed.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::new(Status::Closed, "Socket is closed"))
        }
    }

    /// Reads available bytes into `buf`, returning 0 at end of stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        self.ops.read(buf)
    }

    /// Writes all of `buf`, buffering as the variant allows.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.touch_last_write();
        self.ops.write(buf)
    }

    /// Writes the decimal rendering of an integer.
    pub fn write_int(&self, value: i64) -> Result<()> {
        let mut buffer = itoa_buffer();
        let text = write_decimal(value, &mut buffer);
        self.write(text)
    }

    /// Writes the bytes of a string.
    pub fn write_str(&self, text: &str) -> Result<()> {
        self.write(text.as_bytes())
    }

    /// Appends bytes to the base64 sub-stream, emitting encoded output
    /// whenever the staging buffer fills.
    pub fn write_base64(&self, buf: &[u8]) -> Result<()> {
        let mut state = lock(&self.base64);
        let mut remaining = buf;

        while !remaining.is_empty() {
            let space = BASE64_READY_BUFFER_SIZE - state.ready_len;
            let take = remaining.len().min(space);
            let start = state.ready_len;
            state.ready[start..start + take].copy_from_slice(&remaining[..take]);
            state.ready_len += take;
            remaining = &remaining[take..];

            if state.ready_len == BASE64_READY_BUFFER_SIZE {
                self.emit_base64(&mut state)?;
            }
        }

        Ok(())
    }

    /// Encodes and emits any residual base64 input, padding the final group
    /// with `=` as needed.
    pub fn flush_base64(&self) -> Result<()> {
        let mut state = lock(&self.base64);
        self.emit_base64(&mut state)
    }

    fn emit_base64(&self, state: &mut Base64) -> Result<()> {
        let mut encoded = [0u8; BASE64_ENCODED_BUFFER_SIZE];
        let mut encoded_len = 0;

        let mut groups = state.ready[..state.ready_len].chunks_exact(3);
        for group in groups.by_ref() {
            encode_base64_group(
                group[0],
                Some(group[1]),
                Some(group[2]),
                &mut encoded[encoded_len..],
            );
            encoded_len += 4;
        }

        match *groups.remainder() {
            [a] => {
                encode_base64_group(a, None, None, &mut encoded[encoded_len..]);
                encoded_len += 4;
            }
            [a, b] => {
                encode_base64_group(a, Some(b), None, &mut encoded[encoded_len..]);
                encoded_len += 4;
            }
            _ => {}
        }

        state.ready_len = 0;

        if encoded_len > 0 {
            self.write(&encoded[..encoded_len])?;
        }
        Ok(())
    }

    /// Flushes buffered output through to the underlying medium.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.ops.flush()
    }

    /// Waits until a read will not block.
    ///
    /// Returns `Ok(true)` when readable, `Ok(false)` if the timeout elapsed
    /// first; `None` waits indefinitely.
    pub fn select(&self, timeout: Option<Duration>) -> Result<bool> {
        self.ensure_open()?;
        self.ops.select(timeout)
    }

    /// Acquires the instruction lock, guaranteeing that whole instructions
    /// written under the returned guard are not interleaved with
    /// instructions from other writers on this transport.
    pub fn lock_instruction(&self) -> InstructionGuard<'_> {
        InstructionGuard {
            _guard: self.instruction_mutex().map(lock),
        }
    }

    pub(crate) fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        self.ops.instruction_mutex()
    }

    /// Arms the keep-alive task: while the socket stays open, a `nop`
    /// instruction is emitted whenever no write has occurred for the
    /// standard interval.
    pub fn require_keep_alive(self: &Arc<Self>) {
        self.require_keep_alive_every(KEEP_ALIVE_INTERVAL);
    }

    /// Arms the keep-alive task with a caller-chosen idle interval.
    pub fn require_keep_alive_every(self: &Arc<Self>, interval: Duration) {
        let mut slot = lock(&self.keep_alive);
        if slot.is_none() {
            *slot = Some(KeepAlive::spawn(Arc::downgrade(self), interval));
        }
    }

    /// Microseconds elapsed since the most recent write.
    pub(crate) fn idle_micros(&self) -> u64 {
        let now = self.epoch.elapsed().as_micros() as u64;
        now.saturating_sub(self.last_write.load(Ordering::Relaxed))
    }

    fn touch_last_write(&self) {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.last_write.store(now, Ordering::Relaxed);
    }

    /// Flushes and closes the socket. Closed is terminal: all further
    /// operations fail with [`Status::Closed`].
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = self.ops.flush();
        let shutdown = self.ops.shutdown();

        if let Some(keep_alive) = lock(&self.keep_alive).take() {
            keep_alive.stop();
        }

        flushed.and(shutdown)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Locks a mutex, ignoring poisoning: socket state stays usable even if a
/// writer thread panicked while holding the lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn itoa_buffer() -> [u8; 20] {
    [0; 20]
}

/// Renders a signed integer as decimal ASCII into `buf`, returning the
/// written slice.
fn write_decimal(value: i64, buf: &mut [u8; 20]) -> &[u8] {
    let mut cursor = buf.len();
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();

    loop {
        cursor -= 1;
        buf[cursor] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }

    if negative {
        cursor -= 1;
        buf[cursor] = b'-';
    }

    &buf[cursor..]
}
