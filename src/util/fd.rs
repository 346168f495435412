use std::{io, os::fd::RawFd};

use tracing::{debug, warn};

/// Close a descriptor, logging instead of failing.
///
/// Teardown of an already-dead descriptor is expected during peer resets, so
/// `EBADF` is reported at debug level and otherwise ignored.
pub fn close_fd_quiet(fd: RawFd) {
    // After this call, consider fd dead in all code paths.
    let ret = unsafe { libc::close(fd) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EBADF) => {
                debug!(fd, "close -> EBADF (descriptor already gone)");
            }
            Some(libc::EINTR) => {
                debug!(fd, "close interrupted by signal (EINTR); not retrying");
            }
            _ => {
                warn!(fd, error = %err, "close failed");
            }
        }
    }
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_double_close_is_quiet() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.into_raw_fd();
        close_fd_quiet(fd);
        // second close hits EBADF and must not panic
        close_fd_quiet(fd);
    }

    #[test]
    fn test_set_nonblocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.into_raw_fd();
        set_nonblocking(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        close_fd_quiet(fd);
    }
}
