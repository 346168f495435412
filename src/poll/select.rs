use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::warn;

use crate::core::channel::{Channel, ChannelHandle, Interest, Readiness};
use crate::error::{Error, Result};

use super::ReadyEvent;

/// Hard width of an `fd_set`; descriptors at or above it cannot be watched.
pub const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

struct Watch {
    handle: ChannelHandle,
    interest: Interest,
}

/// `select(2)` backend.
///
/// `select` only reports how many bits are set, so after every wakeup the
/// registered descriptors are scanned to find out which ones they were.
pub struct SelectPoller {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    watches: BTreeMap<RawFd, Watch>,
}

impl SelectPoller {
    pub fn new() -> Self {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
        }
        Self {
            read_set,
            write_set,
            watches: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, channel: &Channel) -> Result<()> {
        let fd = channel.fd;
        if fd < 0 || fd as usize >= FD_SETSIZE {
            return Err(Error::ResourceExhausted {
                resource: "select fd_set",
                limit: FD_SETSIZE,
            });
        }

        unsafe {
            libc::FD_CLR(fd, &mut self.read_set);
            libc::FD_CLR(fd, &mut self.write_set);
            if channel.interest.is_readable() {
                libc::FD_SET(fd, &mut self.read_set);
            }
            if channel.interest.is_writable() {
                libc::FD_SET(fd, &mut self.write_set);
            }
        }

        self.watches.insert(
            fd,
            Watch {
                handle: channel.handle,
                interest: channel.interest,
            },
        );
        Ok(())
    }

    pub fn deregister(&mut self, channel: &Channel) {
        if self.watches.remove(&channel.fd).is_none() {
            return;
        }
        unsafe {
            libc::FD_CLR(channel.fd, &mut self.read_set);
            libc::FD_CLR(channel.fd, &mut self.write_set);
        }
    }

    pub fn wait(&mut self, timeout: Duration, out: &mut Vec<ReadyEvent>) -> Result<usize> {
        // select overwrites the sets it is given
        let mut read_ready = self.read_set;
        let mut write_ready = self.write_set;
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs().min(i32::MAX as u64) as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let nfds = self.watches.keys().next_back().map_or(0, |&fd| fd + 1);

        let n = unsafe {
            libc::select(
                nfds,
                &mut read_ready,
                &mut write_ready,
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(0),
                Some(libc::EBADF) => Ok(self.report_dead(out)),
                _ => Err(Error::Io(err)),
            };
        }
        if n == 0 {
            return Ok(0);
        }

        let mut bits_left = n as usize;
        let mut produced = 0;
        for (&fd, watch) in &self.watches {
            if bits_left == 0 {
                break;
            }
            let mut readiness = Readiness::EMPTY;
            unsafe {
                if watch.interest.is_readable() && libc::FD_ISSET(fd, &read_ready) {
                    readiness |= Readiness::READABLE;
                    bits_left -= 1;
                }
                if watch.interest.is_writable() && libc::FD_ISSET(fd, &write_ready) {
                    readiness |= Readiness::WRITABLE;
                    bits_left = bits_left.saturating_sub(1);
                }
            }
            if !readiness.is_empty() {
                out.push(ReadyEvent {
                    handle: watch.handle,
                    readiness,
                });
                produced += 1;
            }
        }
        Ok(produced)
    }

    pub fn registered(&self) -> usize {
        self.watches.len()
    }

    /// `EBADF` means a watched descriptor was closed behind our back. Report
    /// every such descriptor as errored so the loop tears its channel down.
    fn report_dead(&self, out: &mut Vec<ReadyEvent>) -> usize {
        let mut produced = 0;
        for (&fd, watch) in &self.watches {
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                warn!(fd, "select: watched descriptor is no longer open");
                out.push(ReadyEvent {
                    handle: watch.handle,
                    readiness: Readiness::ERROR,
                });
                produced += 1;
            }
        }
        produced
    }
}

impl Default for SelectPoller {
    fn default() -> Self {
        Self::new()
    }
}
