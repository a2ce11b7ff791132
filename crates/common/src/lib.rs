//! Shared primitives for the Guacamole proxy daemon.
//!
//! This crate holds the pieces that every other crate in the workspace leans
//! on: the closed [`Status`] taxonomy and its [`Error`] carrier, the FIFO
//! [`pool::IntPool`] allocator, the reentrant [`rwlock::ReentrantRwLock`],
//! the connection [`id`] generator, and the [`unicode`] helpers used by the
//! wire codec to count and move UTF-8 code points.

pub mod error;
pub mod id;
pub mod pool;
pub mod rwlock;
pub mod status;
pub mod unicode;

pub use error::{Error, Result};
pub use status::Status;
