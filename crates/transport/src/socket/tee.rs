//! Transport duplicating writes onto a secondary socket.
//!
//! Reads, readiness, error results, and instruction-lock scope all come
//! from the primary socket; the secondary receives a copy of every write
//! and flush, with its failures ignored. Dropping the tee drops both
//! underlying sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Result;

use crate::socket::{Socket, SocketOps};

pub struct TeeOps {
    primary: Arc<Socket>,
    secondary: Arc<Socket>,
}

impl TeeOps {
    pub fn new(primary: Arc<Socket>, secondary: Arc<Socket>) -> Self {
        Self { primary, secondary }
    }
}

impl SocketOps for TeeOps {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.primary.read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        /* Duplicate onto the secondary, ignoring its result */
        let _ = self.secondary.write(buf);
        self.primary.write(buf)
    }

    fn flush(&self) -> Result<()> {
        let _ = self.secondary.flush();
        self.primary.flush()
    }

    fn select(&self, timeout: Option<Duration>) -> Result<bool> {
        self.primary.select(timeout)
    }

    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        self.primary.instruction_mutex()
    }
}
