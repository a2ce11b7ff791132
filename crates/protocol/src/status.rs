//! Client-visible protocol status codes.
//!
//! These numeric codes travel inside `error` instructions and related
//! protocol messages. The set is defined by the display protocol and is
//! closed; the daemon never invents codes outside it.

use std::fmt;

/// Status codes defined by the display protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProtocolStatus {
    /// The operation succeeded.
    Success = 0x0000,
    /// The requested operation is unsupported.
    Unsupported = 0x0100,
    /// The operation could not be performed due to an internal failure.
    ServerError = 0x0200,
    /// The operation could not be performed as the server is busy.
    ServerBusy = 0x0201,
    /// The upstream server is not responding.
    UpstreamTimeout = 0x0202,
    /// The upstream server returned an error.
    UpstreamError = 0x0203,
    /// The requested resource does not exist.
    ResourceNotFound = 0x0204,
    /// The requested resource is already in use.
    ResourceConflict = 0x0205,
    /// The requested resource is now closed.
    ResourceClosed = 0x0206,
    /// The upstream server does not appear to exist.
    UpstreamNotFound = 0x0207,
    /// The upstream server is not available to service requests.
    UpstreamUnavailable = 0x0208,
    /// The session conflicted with another session.
    SessionConflict = 0x0209,
    /// The session appeared to be inactive.
    SessionTimeout = 0x020A,
    /// The session was forcibly terminated.
    SessionClosed = 0x020B,
    /// The parameters of the request are illegal.
    ClientBadRequest = 0x0300,
    /// Permission was denied, as the user is not authorized.
    ClientUnauthorized = 0x0301,
    /// Permission was denied, and authorization cannot help.
    ClientForbidden = 0x0303,
    /// The client took too long to respond.
    ClientTimeout = 0x0308,
    /// The client sent more data than the protocol allows.
    ClientOverrun = 0x030D,
    /// The client sent data of an unexpected or illegal type.
    ClientBadType = 0x030F,
    /// The client is already using too many connections.
    ClientTooMany = 0x031D,
}

impl ProtocolStatus {
    /// The numeric code carried on the wire.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
