//! The error value threaded through every fallible call in the workspace.
//!
//! Where the upstream C library records a thread-local status/message pair,
//! this implementation returns an explicit [`Error`] carrying a [`Status`]
//! from the closed taxonomy plus a short message. Composite operations
//! propagate the innermost error unchanged with `?`.

use std::borrow::Cow;
use std::io;

use thiserror::Error as ThisError;

use crate::status::Status;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed daemon operation: a status code plus a short diagnostic message.
#[derive(Clone, Debug, ThisError)]
#[error("{message}")]
pub struct Error {
    status: Status,
    message: Cow<'static, str>,
}

impl Error {
    /// Builds an error from a status code and message.
    pub fn new(status: Status, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The status code classifying this error.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The diagnostic message attached to this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if this error indicates the underlying stream has closed.
    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    /// True if this error is a timeout and the operation may be retried.
    pub fn is_timeout(&self) -> bool {
        self.status == Status::Timeout
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self {
            status,
            message: Cow::Borrowed(status.as_str()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let status = match err.kind() {
            io::ErrorKind::TimedOut => Status::Timeout,
            io::ErrorKind::WouldBlock => Status::WouldBlock,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Status::Closed,
            io::ErrorKind::PermissionDenied => Status::PermissionDenied,
            io::ErrorKind::InvalidInput => Status::InvalidArgument,
            io::ErrorKind::NotFound => Status::NotFound,
            io::ErrorKind::Interrupted => Status::TryAgain,
            io::ErrorKind::OutOfMemory => Status::NoMemory,
            _ => Status::SeeErrno,
        };
        Self {
            status,
            message: Cow::Owned(err.to_string()),
        }
    }
}
