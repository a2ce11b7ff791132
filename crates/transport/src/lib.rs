//! Byte-stream transports for the Guacamole proxy daemon.
//!
//! Every byte entering or leaving the daemon flows through a [`Socket`]: a
//! buffered, lockable transport with a variant-specific backend. Backends
//! cover a plain file descriptor, a TLS session, a tee of two transports, a
//! write-only broadcast over many transports, and an in-memory transport
//! used by tests and loopback plumbing.
//!
//! Beyond raw reads and writes, a socket provides the pieces the display
//! protocol layer is built on: an instruction lock serializing whole
//! instructions across writers, a base64 sub-stream for binary payloads,
//! poll-based readiness, and an optional keep-alive task that emits `nop`
//! instructions while the transport is idle.

mod keepalive;
mod socket;
mod wait;

pub use socket::broadcast::BroadcastHandle;
pub use socket::mem::MemHandle;
pub use socket::tls::{TlsAcceptor, load_server_config};
pub use socket::{InstructionGuard, Socket, SocketOps};
pub use wait::wait_readable;

/// The number of bytes buffered within each socket before flushing.
pub const OUTPUT_BUFFER_SIZE: usize = 8192;

/// Interval between keep-alive pings on sockets with keep-alive armed.
pub const KEEP_ALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(5000);

/// The number of bytes of data buffered prior to bulk conversion to base64.
pub const BASE64_READY_BUFFER_SIZE: usize = 768;

/// The size of the staging area holding a full ready buffer encoded as
/// base64.
pub const BASE64_ENCODED_BUFFER_SIZE: usize = 1024;

/// The keep-alive ping, as framed on the wire.
pub const NOP_INSTRUCTION: &[u8] = b"3.nop;";
