use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use tracing::warn;

/// Drains a non-blocking listening socket.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the backlog is empty. Ownership of every returned
    /// descriptor passes to the caller.
    pub fn accept_pending(&self) -> Vec<(RawFd, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => accepted.push((stream.into_raw_fd(), peer)),
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                    _ => {
                        // EMFILE and friends: leave the rest queued for the next edge
                        warn!(fd = self.fd(), error = %e, "accept failed");
                        break;
                    }
                },
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::fd::close_fd_quiet;
    use std::net::TcpStream;

    #[test]
    fn test_accepts_everything_queued() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let acceptor = Acceptor::new(listener).unwrap();
        let addr = acceptor.local_addr().unwrap();

        assert!(acceptor.accept_pending().is_empty());

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();

        let mut got = Vec::new();
        for _ in 0..50 {
            got.extend(acceptor.accept_pending());
            if got.len() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(got.len(), 2);
        for (fd, _) in got {
            close_fd_quiet(fd);
        }
    }
}
