use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, error};

use crate::core::channel::{Channel, ChannelHandle, Readiness};
use crate::core::constants::INITIAL_EVENT_CAPACITY;
use crate::core::token::{TokenOp, pack_token, unpack_token};
use crate::error::{Error, Result};
use crate::util::fd::close_fd_quiet;

use super::{ReadyEvent, timeout_millis};

/// Edge-triggered epoll backend.
///
/// Interest is always registered with `EPOLLET`, so a descriptor is reported
/// once per kernel transition and not again until new data arrives.
pub struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    registered: HashMap<RawFd, ChannelHandle>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY],
            registered: HashMap::new(),
        })
    }

    pub fn register(&mut self, channel: &Channel) -> Result<()> {
        let mut flags = libc::EPOLLET as u32;
        if channel.interest.is_readable() {
            flags |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if channel.interest.is_writable() {
            flags |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event {
            events: flags,
            u64: pack_token(channel.handle, TokenOp::Readiness),
        };

        let op = if self.registered.contains_key(&channel.fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, channel.fd, &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => {
                    error!(fd = channel.fd, "epoll already watches an fd we never added");
                    Error::InvariantViolation(format!(
                        "fd {} registered with epoll outside this poller",
                        channel.fd
                    ))
                }
                Some(libc::ENOENT) => {
                    error!(fd = channel.fd, "epoll lost an fd we believed registered");
                    Error::InvariantViolation(format!(
                        "fd {} closed while still registered",
                        channel.fd
                    ))
                }
                Some(libc::ENOSPC) | Some(libc::ENOMEM) => Error::ResourceExhausted {
                    resource: "epoll watches",
                    limit: self.registered.len(),
                },
                _ => Error::Io(err),
            });
        }

        self.registered.insert(channel.fd, channel.handle);
        Ok(())
    }

    pub fn deregister(&mut self, channel: &Channel) {
        if self.registered.remove(&channel.fd).is_none() {
            return;
        }
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_DEL,
                channel.fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            // the fd may already be closed, which drops it from the set anyway
            debug!(fd = channel.fd, error = %io::Error::last_os_error(), "epoll DEL failed");
        }
    }

    pub fn wait(&mut self, timeout: Duration, out: &mut Vec<ReadyEvent>) -> Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }

        let n = n as usize;
        let mut produced = 0;
        for ev in &self.events[..n] {
            let bits = ev.events;
            let token = ev.u64;
            let Some((handle, TokenOp::Readiness)) = unpack_token(token) else {
                continue;
            };
            out.push(ReadyEvent {
                handle,
                readiness: readiness_from_epoll(bits),
            });
            produced += 1;
        }

        // table was full, more may have been pending; grow for next time
        if n == self.events.len() {
            let grown = self.events.len() * 2;
            self.events
                .resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }

        Ok(produced)
    }

    pub fn registered(&self) -> usize {
        self.registered.len()
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        close_fd_quiet(self.epoll_fd);
    }
}

fn readiness_from_epoll(bits: u32) -> Readiness {
    let mut r = Readiness::EMPTY;
    if bits & libc::EPOLLIN as u32 != 0 {
        r |= Readiness::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        r |= Readiness::WRITABLE;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        r |= Readiness::HANGUP;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        r |= Readiness::ERROR;
    }
    r
}
