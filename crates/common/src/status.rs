//! The closed set of status codes used across the daemon.
//!
//! Every fallible operation in the workspace reports one of these codes
//! through [`crate::Error`]. The set is closed: callers match on it to
//! decide between retry, close, and user-visible failure.

use std::fmt;

/// Outcome classification for daemon operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// No error occurred.
    Success,
    /// Insufficient memory to complete the operation.
    NoMemory,
    /// The resource is closed; no further operations are possible.
    Closed,
    /// Timeout while waiting on a blocking operation.
    Timeout,
    /// An error reported by the operating system occurred.
    SeeErrno,
    /// An error prevented the I/O operation from succeeding.
    IoError,
    /// An argument was invalid.
    InvalidArgument,
    /// An internal failure occurred within the daemon.
    InternalError,
    /// Insufficient space remaining to complete the operation.
    NoSpace,
    /// The input provided was too large.
    InputTooLarge,
    /// The result of the operation would be too large.
    ResultTooLarge,
    /// Permission was denied to perform the operation.
    PermissionDenied,
    /// The resource is in use.
    Busy,
    /// The resource is not currently available.
    NotAvailable,
    /// The operation is not supported.
    NotSupported,
    /// Support for the operation is not yet implemented.
    NotImplemented,
    /// The operation is temporarily unable to succeed and may be retried.
    TryAgain,
    /// A violation of the display protocol occurred.
    ProtocolError,
    /// The requested object does not exist.
    NotFound,
    /// The operation was canceled.
    Canceled,
    /// A value is outside the allowed range.
    OutOfRange,
    /// The operation was explicitly refused.
    Refused,
    /// Too many resources are in use.
    TooMany,
    /// The operation would block.
    WouldBlock,
}

impl Status {
    /// A short human-readable description of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::NoMemory => "Insufficient memory",
            Self::Closed => "Closed",
            Self::Timeout => "Timed out",
            Self::SeeErrno => "System error",
            Self::IoError => "Input/output error",
            Self::InvalidArgument => "Invalid argument",
            Self::InternalError => "Internal error",
            Self::NoSpace => "Insufficient space",
            Self::InputTooLarge => "Input too large",
            Self::ResultTooLarge => "Result too large",
            Self::PermissionDenied => "Permission denied",
            Self::Busy => "Resource busy",
            Self::NotAvailable => "Resource not available",
            Self::NotSupported => "Not supported",
            Self::NotImplemented => "Not implemented",
            Self::TryAgain => "Temporary failure",
            Self::ProtocolError => "Protocol violation",
            Self::NotFound => "Not found",
            Self::Canceled => "Canceled",
            Self::OutOfRange => "Value out of range",
            Self::Refused => "Operation refused",
            Self::TooMany => "Insufficient resources",
            Self::WouldBlock => "Operation would block",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_description() {
        assert_eq!(Status::Timeout.to_string(), "Timed out");
        assert_eq!(Status::ProtocolError.to_string(), "Protocol violation");
    }

    #[test]
    fn statuses_are_distinguishable() {
        assert_ne!(Status::Closed, Status::Timeout);
        assert_eq!(Status::Closed, Status::Closed);
    }
}
