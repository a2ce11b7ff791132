//! Transport backed by a plain file descriptor.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;

use common::{Error, Result};

use crate::OUTPUT_BUFFER_SIZE;
use crate::socket::SocketOps;
use crate::wait::wait_readable;

/// Output buffering shared by the descriptor-backed variants: bytes are
/// staged here and pushed to the medium on flush or when the buffer fills.
pub(crate) struct OutputBuffer {
    buf: Box<[u8; OUTPUT_BUFFER_SIZE]>,
    len: usize,
}

impl OutputBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Box::new([0; OUTPUT_BUFFER_SIZE]),
            len: 0,
        }
    }

    /// Appends as much of `data` as fits, returning the number of bytes
    /// taken. Zero means the buffer must be flushed before progress.
    pub(crate) fn append(&mut self, data: &[u8]) -> usize {
        let space = OUTPUT_BUFFER_SIZE - self.len;
        let take = data.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&data[..take]);
        self.len += take;
        take
    }

    pub(crate) fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == OUTPUT_BUFFER_SIZE
    }
}

/// Transport writing to and reading from an owned file descriptor.
pub struct FdOps {
    fd: OwnedFd,
    /// Protects the output buffer, guaranteeing atomicity of concurrent
    /// writes and flushes.
    out: Mutex<OutputBuffer>,
    /// Held for the duration of each whole instruction.
    instruction: Mutex<()>,
}

impl FdOps {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            out: Mutex::new(OutputBuffer::new()),
            instruction: Mutex::new(()),
        }
    }

    /// Writes the entire buffer directly to the descriptor, retrying
    /// partial writes until every byte is out.
    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match nix::unistd::write(self.fd.as_fd(), buf) {
                Ok(written) => buf = &buf[written..],
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(Error::from(std::io::Error::from(errno)));
                }
            }
        }
        Ok(())
    }

    /// Flushes buffered output. The output lock must already be held.
    fn flush_locked(&self, out: &mut OutputBuffer) -> Result<()> {
        if !out.pending().is_empty() {
            self.write_all(out.pending())?;
            out.clear();
        }
        Ok(())
    }
}

impl SocketOps for FdOps {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(count) => return Ok(count),
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(Error::from(std::io::Error::from(errno)));
                }
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        /* Append to buffer, flushing whenever it fills */
        let mut remaining = buf;
        while !remaining.is_empty() {
            if out.is_full() {
                self.flush_locked(&mut out)?;
            }
            let taken = out.append(remaining);
            remaining = &remaining[taken..];
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.flush_locked(&mut out)
    }

    fn select(&self, timeout: Option<Duration>) -> Result<bool> {
        wait_readable(self.fd.as_fd(), timeout)
    }

    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Socket;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn socket_pair() -> (std::sync::Arc<Socket>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        (Socket::open(OwnedFd::from(ours)), theirs)
    }

    #[test]
    fn writes_are_buffered_until_flush() {
        let (socket, mut peer) = socket_pair();
        peer.set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout");

        socket.write(b"buffered").expect("write");

        /* Nothing on the wire yet */
        let mut probe = [0u8; 16];
        assert!(peer.read(&mut probe).is_err());

        socket.flush().expect("flush");
        let mut received = [0u8; 8];
        peer.read_exact(&mut received).expect("read");
        assert_eq!(&received, b"buffered");
    }

    #[test]
    fn overflowing_the_buffer_forces_a_flush() {
        let (socket, mut peer) = socket_pair();
        let payload = vec![0x41u8; OUTPUT_BUFFER_SIZE + 16];

        let writer = {
            let socket = std::sync::Arc::clone(&socket);
            let payload = payload.clone();
            std::thread::spawn(move || {
                socket.write(&payload).expect("write");
                socket.flush().expect("flush");
            })
        };

        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        while received.len() < payload.len() {
            let count = peer.read(&mut chunk).expect("read");
            assert_ne!(count, 0, "peer closed early");
            received.extend_from_slice(&chunk[..count]);
        }
        writer.join().expect("writer thread");
        assert_eq!(received, payload);
    }

    #[test]
    fn read_returns_zero_at_end_of_stream() {
        let (socket, peer) = socket_pair();
        drop(peer);
        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn select_observes_incoming_data() {
        let (socket, mut peer) = socket_pair();
        assert!(!socket.select(Some(Duration::from_millis(10))).expect("select"));

        peer.write_all(b"x").expect("write");
        assert!(socket.select(Some(Duration::from_secs(5))).expect("select"));
    }
}
