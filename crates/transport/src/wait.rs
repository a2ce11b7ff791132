//! Readiness waiting on raw file descriptors.

use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use common::{Error, Result, Status};

/// Waits until the given descriptor is readable.
///
/// Returns `Ok(true)` once data (or end-of-stream) can be read without
/// blocking, `Ok(false)` if the timeout elapses first. A timeout of `None`
/// waits indefinitely.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<bool> {
    let poll_timeout = match timeout {
        None => PollTimeout::NONE,
        Some(duration) => {
            let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    };

    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                ) {
                    return Ok(true);
                }
                return Err(Error::new(
                    Status::SeeErrno,
                    "Error while waiting for data on socket",
                ));
            }
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(std::io::Error::from(errno).into()),
        }
    }
}
