//! Readiness backends
//!
//! A closed set of kernel-polling strategies behind one enum, chosen once at
//! startup:
//! - `epoll`: edge-triggered, event-table based
//! - `select`: fd_set bitmaps with a fixed descriptor ceiling
//! - `io_uring`: one-shot poll submissions reaped from the completion queue
//!
//! The loop thread is the only caller of any of these; none of them is safe
//! to share across threads.

pub mod epoll;
pub mod select;
pub mod uring;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::core::channel::{Channel, ChannelHandle, Readiness};
use crate::error::{Error, Result};

pub use epoll::EpollPoller;
pub use select::SelectPoller;
pub use uring::UringPoller;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub enum PollStrategyKind {
    #[default]
    #[serde(rename = "epoll")]
    Epoll,
    #[serde(rename = "select")]
    Select,
    #[serde(rename = "io_uring", alias = "uring")]
    IoUring,
}

impl PollStrategyKind {
    pub fn name(self) -> &'static str {
        match self {
            PollStrategyKind::Epoll => "epoll",
            PollStrategyKind::Select => "select",
            PollStrategyKind::IoUring => "io_uring",
        }
    }
}

impl fmt::Display for PollStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PollStrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoll" => Ok(PollStrategyKind::Epoll),
            "select" => Ok(PollStrategyKind::Select),
            "io_uring" | "uring" | "iouring" => Ok(PollStrategyKind::IoUring),
            other => Err(Error::Config(format!("unknown poll strategy '{other}'"))),
        }
    }
}

/// One readiness transition reported by a backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadyEvent {
    pub handle: ChannelHandle,
    pub readiness: Readiness,
}

pub enum Poller {
    Epoll(EpollPoller),
    Select(SelectPoller),
    Uring(UringPoller),
}

impl Poller {
    pub fn new(kind: PollStrategyKind, ring_entries: u32) -> Result<Self> {
        Ok(match kind {
            PollStrategyKind::Epoll => Poller::Epoll(EpollPoller::new()?),
            PollStrategyKind::Select => Poller::Select(SelectPoller::new()),
            PollStrategyKind::IoUring => Poller::Uring(UringPoller::new(ring_entries)?),
        })
    }

    pub fn kind(&self) -> PollStrategyKind {
        match self {
            Poller::Epoll(_) => PollStrategyKind::Epoll,
            Poller::Select(_) => PollStrategyKind::Select,
            Poller::Uring(_) => PollStrategyKind::IoUring,
        }
    }

    /// Add the channel, or update its interest if its descriptor is already
    /// registered.
    pub fn register(&mut self, channel: &Channel) -> Result<()> {
        match self {
            Poller::Epoll(p) => p.register(channel),
            Poller::Select(p) => p.register(channel),
            Poller::Uring(p) => p.register(channel),
        }
    }

    /// No-op when the channel is not registered.
    pub fn deregister(&mut self, channel: &Channel) {
        match self {
            Poller::Epoll(p) => p.deregister(channel),
            Poller::Select(p) => p.deregister(channel),
            Poller::Uring(p) => p.deregister(channel),
        }
    }

    /// Block up to `timeout` and append ready channels to `out`.
    ///
    /// Returns the number of events appended; zero means the timeout expired
    /// (or the wait was interrupted), which callers treat as idle.
    pub fn wait(&mut self, timeout: Duration, out: &mut Vec<ReadyEvent>) -> Result<usize> {
        match self {
            Poller::Epoll(p) => p.wait(timeout, out),
            Poller::Select(p) => p.wait(timeout, out),
            Poller::Uring(p) => p.wait(timeout, out),
        }
    }

    pub fn registered(&self) -> usize {
        match self {
            Poller::Epoll(p) => p.registered(),
            Poller::Select(p) => p.registered(),
            Poller::Uring(p) => p.registered(),
        }
    }
}

/// Clamp a wait timeout into the millisecond range the syscalls accept.
pub(crate) fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}
