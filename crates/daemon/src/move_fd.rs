//! Descriptor passing between the daemon and worker processes.
//!
//! An accepted client's descriptor is handed to its worker over a
//! UNIX-domain socket as `SCM_RIGHTS` ancillary data, alongside a one-byte
//! in-band sentinel. The receiver validates the sentinel so that stray
//! traffic on the channel is rejected rather than misinterpreted.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use sendfd::{RecvWithFd, SendWithFd};

use common::{Error, Result, Status};

/// The in-band byte accompanying every passed descriptor.
pub const SENTINEL: u8 = b'G';

/// Sends one open file descriptor across the given channel.
pub fn send_fd(channel: &UnixStream, fd: BorrowedFd<'_>) -> Result<()> {
    let sent = channel.send_with_fd(&[SENTINEL], &[fd.as_raw_fd()])?;
    if sent != 1 {
        return Err(Error::new(
            Status::IoError,
            "Short write while sending descriptor",
        ));
    }
    Ok(())
}

/// Receives one file descriptor from the given channel.
///
/// Fails with [`Status::ProtocolError`] if the in-band byte is not the
/// expected sentinel, and with [`Status::Closed`] at end of stream.
pub fn recv_fd(channel: &UnixStream) -> Result<OwnedFd> {
    let mut message = [0u8; 1];
    let mut fds: [RawFd; 1] = [-1];
    let (bytes, fd_count) = channel.recv_with_fd(&mut message, &mut fds)?;

    if bytes == 0 {
        return Err(Error::new(
            Status::Closed,
            "End of stream on descriptor channel",
        ));
    }

    /* Take ownership of whatever arrived before validating, so a bad
     * message cannot leak its descriptor */
    let received = (fd_count > 0).then(|| {
        // SAFETY: recv_with_fd reports fds[..fd_count] as freshly received
        // open descriptors owned by this process.
        unsafe { OwnedFd::from_raw_fd(fds[0]) }
    });

    if message[0] != SENTINEL {
        return Err(Error::new(
            Status::ProtocolError,
            "Unexpected message on descriptor channel",
        ));
    }

    received.ok_or_else(|| {
        Error::new(
            Status::ProtocolError,
            "Descriptor channel message carried no descriptor",
        )
    })
}
