//! Transport forwarding its output as `nest` instructions on a parent
//! socket.
//!
//! Writes accumulate in an internal buffer; each flush emits one
//! instruction of the form `4.nest,<index>,<framed-bytes>;` on the parent,
//! where the framed bytes are themselves a sequence of complete
//! instructions. The parent is not flushed implicitly.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{Error, Result, Status, unicode};
use transport::{Socket, SocketOps};

use crate::wire::write_element_bytes;

struct NestOps {
    parent: Arc<Socket>,
    index: u64,
    buf: Mutex<Vec<u8>>,
    instruction: Mutex<()>,
}

/// Wraps a parent socket, forwarding all writes as framed `nest`
/// instructions carrying the given stream index.
pub fn nest(parent: Arc<Socket>, index: u64) -> Arc<Socket> {
    Socket::from_ops(Box::new(NestOps {
        parent,
        index,
        buf: Mutex::new(Vec::new()),
        instruction: Mutex::new(()),
    }))
}

impl SocketOps for NestOps {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::new(
            Status::NotSupported,
            "Nested sockets are write-only",
        ))
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        let mut pending = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        pending.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let payload = {
            let mut pending = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };

        if payload.is_empty() {
            return Ok(());
        }

        /* One whole nest instruction on the parent per flush */
        let _lock = self.parent.lock_instruction();
        write_element_bytes(&self.parent, b"nest")?;
        self.parent.write(b",")?;
        write_element_bytes(&self.parent, self.index.to_string().as_bytes())?;
        self.parent.write(b",")?;
        self.parent.write_int(unicode::strlen(&payload) as i64)?;
        self.parent.write(b".")?;
        self.parent.write(&payload)?;
        self.parent.write(b";")
    }

    fn select(&self, _timeout: Option<Duration>) -> Result<bool> {
        Err(Error::new(
            Status::NotSupported,
            "Nested sockets are write-only",
        ))
    }

    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    const UTF8_4: &str = "\u{72AC}\u{10B00}z\u{E1}";

    #[test]
    fn nested_instructions_frame_as_one_nest_instruction() {
        let (parent, output) = Socket::memory();
        let nested = nest(Arc::clone(&parent), 0);

        let name = format!("a{UTF8_4}b{UTF8_4}c");
        wire::send(&nested, "name", &[name.as_str()]).expect("send name");
        wire::send(&nested, "sync", &["12345"]).expect("send sync");
        nested.flush().expect("flush nested");
        parent.flush().expect("flush parent");

        let expected = format!(
            "4.nest,1.0,37.4.name,11.a{UTF8_4}b{UTF8_4}c;4.sync,5.12345;;"
        );
        assert_eq!(output.output(), expected.into_bytes());
    }

    #[test]
    fn empty_flush_emits_nothing() {
        let (parent, output) = Socket::memory();
        let nested = nest(parent, 3);
        nested.flush().expect("flush");
        assert!(output.output().is_empty());
    }

    #[test]
    fn stream_index_is_framed_as_an_element() {
        let (parent, output) = Socket::memory();
        let nested = nest(Arc::clone(&parent), 12);

        wire::send(&nested, "nop", &[]).expect("send");
        nested.flush().expect("flush");

        assert_eq!(output.output(), b"4.nest,2.12,6.3.nop;;".to_vec());
    }

    #[test]
    fn nested_sockets_refuse_reads() {
        let (parent, _output) = Socket::memory();
        let nested = nest(parent, 0);
        let mut buf = [0u8; 4];
        assert_eq!(
            nested.read(&mut buf).expect_err("read").status(),
            Status::NotSupported
        );
    }
}
