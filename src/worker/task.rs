use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use memchr::memmem::Finder;

use crate::core::channel::ChannelHandle;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Normal = 0,
    Elevated = 1,
}

/// Bytes from one read, queued for the drain phase.
#[derive(Debug)]
pub struct Task {
    pub priority: Priority,
    /// Id of the loop whose arena `origin` belongs to.
    pub worker: usize,
    pub origin: ChannelHandle,
    pub peer: Option<SocketAddr>,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct Lanes {
    elevated: VecDeque<Task>,
    normal: VecDeque<Task>,
}

/// Two-class task queue.
///
/// Pop always drains the elevated lane first; each lane is FIFO. The lock is
/// held only for the push or pop itself, so producers on other loops never
/// wait on task processing.
#[derive(Default)]
pub struct TaskQueue {
    lanes: Mutex<Lanes>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, task: Task) {
        let mut lanes = self.lanes();
        match task.priority {
            Priority::Elevated => lanes.elevated.push_back(task),
            Priority::Normal => lanes.normal.push_back(task),
        }
    }

    pub fn pop(&self) -> Option<Task> {
        let mut lanes = self.lanes();
        lanes
            .elevated
            .pop_front()
            .or_else(|| lanes.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes();
        lanes.elevated.len() + lanes.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finds the priority marker in raw request bytes.
pub struct PriorityMarker {
    finder: Finder<'static>,
    len: usize,
}

impl PriorityMarker {
    pub fn new(marker: &str) -> Self {
        Self {
            finder: Finder::new(marker.as_bytes()).into_owned(),
            len: marker.len(),
        }
    }

    /// Classify `payload`, also looking across the boundary with the bytes
    /// kept from the channel's previous read. `tail` is updated to the last
    /// `marker_len - 1` bytes seen.
    pub fn classify(&self, tail: &mut Vec<u8>, payload: &[u8]) -> Priority {
        if self.len == 0 {
            return Priority::Normal;
        }

        let mut found = self.finder.find(payload).is_some();
        if !found && !tail.is_empty() {
            let head = &payload[..payload.len().min(self.len - 1)];
            let mut seam = Vec::with_capacity(tail.len() + head.len());
            seam.extend_from_slice(tail);
            seam.extend_from_slice(head);
            found = self.finder.find(&seam).is_some();
        }

        let keep = self.len - 1;
        if payload.len() >= keep {
            tail.clear();
            tail.extend_from_slice(&payload[payload.len() - keep..]);
        } else {
            tail.extend_from_slice(payload);
            let excess = tail.len().saturating_sub(keep);
            tail.rotate_left(excess);
            tail.truncate(tail.len() - excess);
        }

        if found {
            Priority::Elevated
        } else {
            Priority::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority, tag: u8) -> Task {
        Task {
            priority,
            worker: 0,
            origin: ChannelHandle {
                index: tag as u32,
                generation: 1,
            },
            peer: None,
            payload: vec![tag],
        }
    }

    #[test]
    fn test_elevated_drains_before_normal() {
        let queue = TaskQueue::new();
        queue.push(task(Priority::Normal, b'A'));
        queue.push(task(Priority::Elevated, b'B'));
        queue.push(task(Priority::Normal, b'C'));
        queue.push(task(Priority::Elevated, b'D'));

        let order: Vec<u8> = std::iter::from_fn(|| queue.pop())
            .map(|t| t.payload[0])
            .collect();
        assert_eq!(order.len(), 4);
        let (head, rest) = order.split_at(2);
        assert!(head.contains(&b'B') && head.contains(&b'D'));
        assert!(rest.contains(&b'A') && rest.contains(&b'C'));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_marker_in_single_read() {
        let marker = PriorityMarker::new("X-Priority: High");
        let mut tail = Vec::new();
        let req = b"GET / HTTP/1.1\r\nX-Priority: High\r\n\r\n";
        assert_eq!(marker.classify(&mut tail, req), Priority::Elevated);
        assert_eq!(
            marker.classify(&mut Vec::new(), b"GET / HTTP/1.1\r\n\r\n"),
            Priority::Normal
        );
    }

    #[test]
    fn test_marker_split_across_reads() {
        let marker = PriorityMarker::new("X-Priority: High");
        let mut tail = Vec::new();
        assert_eq!(
            marker.classify(&mut tail, b"GET / HTTP/1.1\r\nX-Prio"),
            Priority::Normal
        );
        assert_eq!(marker.classify(&mut tail, b"rity: High\r\n\r\n"), Priority::Elevated);
    }

    #[test]
    fn test_tail_stays_bounded() {
        let marker = PriorityMarker::new("abcd");
        let mut tail = Vec::new();
        marker.classify(&mut tail, b"x");
        marker.classify(&mut tail, b"y");
        marker.classify(&mut tail, b"z");
        marker.classify(&mut tail, b"w");
        assert_eq!(tail, b"yzw");
        marker.classify(&mut tail, b"0123456789");
        assert_eq!(tail, b"789");
    }

    #[test]
    fn test_empty_marker_never_elevates() {
        let marker = PriorityMarker::new("");
        assert_eq!(marker.classify(&mut Vec::new(), b"anything"), Priority::Normal);
    }
}
