use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::RawFd;

use crate::core::constants::LISTEN_BACKLOG;

/// Create a non-blocking SO_REUSEPORT listening socket
///
/// Each worker gets its own listener, and the kernel distributes incoming
/// connections across all workers bound to the same port, which keeps every
/// event loop's channel set disjoint.
pub fn make_reuseport_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?; // requires socket2 = { version="0.6", features=["all"] }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(LISTEN_BACKLOG)?;
    Ok(sock.into())
}

/// Result of one bounded, non-blocking read.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(usize),
    /// Zero bytes: orderly shutdown by the peer.
    Closed,
    /// EAGAIN / EINTR: nothing to read yet.
    WouldBlock,
    Failed(io::Error),
}

pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> ReadOutcome {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        return ReadOutcome::Data(n as usize);
    }
    if n == 0 {
        return ReadOutcome::Closed;
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
        _ => ReadOutcome::Failed(err),
    }
}

/// Best-effort write of a complete buffer; stops at would-block.
///
/// Returns the number of bytes the kernel accepted.
pub fn write_nonblocking(fd: RawFd, mut buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while !buf.is_empty() {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => break,
                _ => return Err(err),
            }
        }
        written += n as usize;
        buf = &buf[n as usize..];
    }
    Ok(written)
}
