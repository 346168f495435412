use std::os::fd::RawFd;

use crate::core::channel::Channel;
use crate::worker::task::Task;

/// What the loop should do with a task's origin channel once it is handled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Keep,
    Close,
}

/// Consumer for drained tasks.
///
/// `origin` is the descriptor of the channel the task was read from, or `None`
/// if that channel was torn down before the task reached the front.
pub trait TaskHandler {
    fn handle(&mut self, task: &Task, origin: Option<RawFd>) -> Disposition;

    /// Called once per client channel, right before its descriptor is closed.
    fn on_close(&mut self, _channel: &Channel) {}
}

impl<F> TaskHandler for F
where
    F: FnMut(&Task, Option<RawFd>) -> Disposition,
{
    fn handle(&mut self, task: &Task, origin: Option<RawFd>) -> Disposition {
        self(task, origin)
    }
}
