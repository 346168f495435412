use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{IoUring, opcode, squeue, types};
use tracing::debug;

use crate::core::channel::{Channel, ChannelHandle, Interest, Readiness};
use crate::core::token::{TokenOp, pack_token, unpack_token};
use crate::error::{Error, Result};

use super::ReadyEvent;

struct Arm {
    fd: RawFd,
    interest: Interest,
    /// A PollAdd for this handle is outstanding. At most one ever is.
    in_flight: bool,
}

/// io_uring backend built on one-shot `PollAdd` submissions.
///
/// Submission and completion are decoupled: a channel is armed by queueing a
/// poll, the kernel posts a completion when it becomes ready, and the channel
/// is re-armed on the next wait. A wait that reaps nothing is plain idle.
pub struct UringPoller {
    ring: IoUring,
    entries: u32,
    arms: HashMap<ChannelHandle, Arm>,
    by_fd: HashMap<RawFd, ChannelHandle>,
}

impl UringPoller {
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        Ok(Self {
            ring,
            entries,
            arms: HashMap::new(),
            by_fd: HashMap::new(),
        })
    }

    pub fn register(&mut self, channel: &Channel) -> Result<()> {
        if let Some(&existing) = self.by_fd.get(&channel.fd) {
            // same descriptor: update in place, cancelling the outstanding
            // poll so the next wait re-arms with the new interest
            let in_flight = self.arms.get(&existing).is_some_and(|a| a.in_flight);
            if in_flight {
                self.push_poll_remove(existing)?;
            }
            let arm = self.arms.remove(&existing).map_or(
                Arm {
                    fd: channel.fd,
                    interest: channel.interest,
                    in_flight: false,
                },
                |mut a| {
                    a.interest = channel.interest;
                    // a retagged handle never sees the old completion
                    if existing != channel.handle {
                        a.in_flight = false;
                    }
                    a
                },
            );
            self.arms.insert(channel.handle, arm);
            self.by_fd.insert(channel.fd, channel.handle);
            return Ok(());
        }

        self.arms.insert(
            channel.handle,
            Arm {
                fd: channel.fd,
                interest: channel.interest,
                in_flight: false,
            },
        );
        self.by_fd.insert(channel.fd, channel.handle);
        Ok(())
    }

    pub fn deregister(&mut self, channel: &Channel) {
        let Some(handle) = self.by_fd.remove(&channel.fd) else {
            return;
        };
        if let Some(arm) = self.arms.remove(&handle)
            && arm.in_flight
            && let Err(e) = self.push_poll_remove(handle)
        {
            // the poll completes when the fd closes anyway
            debug!(fd = channel.fd, error = %e, "could not queue poll removal");
        }
    }

    pub fn wait(&mut self, timeout: Duration, out: &mut Vec<ReadyEvent>) -> Result<usize> {
        self.arm_idle()?;

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        if let Err(e) = self.ring.submitter().submit_with_args(1, &args) {
            match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => return Err(Error::Io(e)),
            }
        }

        let mut produced = 0;
        let completions: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for (token, res) in completions {
            let Some((handle, TokenOp::Readiness)) = unpack_token(token) else {
                continue;
            };
            let Some(arm) = self.arms.get_mut(&handle) else {
                // deregistered while the poll was in flight
                continue;
            };
            arm.in_flight = false;

            let readiness = if res >= 0 {
                readiness_from_poll(res as u32)
            } else if res == -libc::ECANCELED {
                continue;
            } else {
                debug!(fd = arm.fd, errno = -res, "poll completion failed");
                Readiness::ERROR
            };
            if readiness.is_empty() {
                continue;
            }
            out.push(ReadyEvent { handle, readiness });
            produced += 1;
        }

        Ok(produced)
    }

    pub fn registered(&self) -> usize {
        self.arms.len()
    }

    fn arm_idle(&mut self) -> Result<()> {
        let pending: Vec<(ChannelHandle, RawFd, Interest)> = self
            .arms
            .iter()
            .filter(|(_, a)| !a.in_flight && a.interest != Interest::NONE)
            .map(|(&h, a)| (h, a.fd, a.interest))
            .collect();

        for (handle, fd, interest) in pending {
            let sqe = opcode::PollAdd::new(types::Fd(fd), poll_mask(interest))
                .build()
                .user_data(pack_token(handle, TokenOp::Readiness));
            self.push(&sqe)?;
            if let Some(arm) = self.arms.get_mut(&handle) {
                arm.in_flight = true;
            }
        }
        Ok(())
    }

    fn push_poll_remove(&mut self, handle: ChannelHandle) -> Result<()> {
        let sqe = opcode::PollRemove::new(pack_token(handle, TokenOp::Readiness))
            .build()
            .user_data(pack_token(handle, TokenOp::PollRemove));
        self.push(&sqe)
    }

    /// Queue one SQE, flushing the submission queue once if it is full.
    fn push(&mut self, sqe: &squeue::Entry) -> Result<()> {
        if unsafe { self.ring.submission().push(sqe) }.is_ok() {
            return Ok(());
        }
        self.ring.submit()?;
        unsafe { self.ring.submission().push(sqe) }.map_err(|_| Error::ResourceExhausted {
            resource: "io_uring submission queue",
            limit: self.entries as usize,
        })
    }
}

fn poll_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.is_readable() {
        mask |= (libc::POLLIN | libc::POLLRDHUP) as u32;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

fn readiness_from_poll(bits: u32) -> Readiness {
    let mut r = Readiness::EMPTY;
    if bits & libc::POLLIN as u32 != 0 {
        r |= Readiness::READABLE;
    }
    if bits & libc::POLLOUT as u32 != 0 {
        r |= Readiness::WRITABLE;
    }
    if bits & (libc::POLLHUP | libc::POLLRDHUP) as u32 != 0 {
        r |= Readiness::HANGUP;
    }
    if bits & (libc::POLLERR | libc::POLLNVAL) as u32 != 0 {
        r |= Readiness::ERROR;
    }
    r
}
