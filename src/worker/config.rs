use std::time::Duration;

use crate::core::constants;
use crate::poll::PollStrategyKind;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Readiness backend, fixed for the life of the loop
    pub poll_strategy: PollStrategyKind,
    /// Upper bound on one readiness wait; also the worst-case shutdown latency
    pub poll_timeout: Duration,
    /// Bytes attempted per read
    pub read_buffer_size: usize,
    /// Ceiling on live channels (listener included)
    pub max_channels: usize,
    /// io_uring queue depth (ignored by the other backends)
    pub ring_entries: u32,
    /// Byte sequence that promotes a task to the elevated class
    pub priority_marker: String,
    /// Read buffers kept around between iterations
    pub idle_buffers: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_strategy: PollStrategyKind::Epoll,
            poll_timeout: Duration::from_millis(constants::DEFAULT_POLL_TIMEOUT_MS),
            read_buffer_size: constants::READ_BUF,
            max_channels: constants::DEFAULT_MAX_CHANNELS,
            ring_entries: constants::DEFAULT_RING_ENTRIES,
            priority_marker: constants::PRIORITY_MARKER.to_string(),
            idle_buffers: 64,
        }
    }
}

impl LoopConfig {
    pub fn with_strategy(poll_strategy: PollStrategyKind) -> Self {
        Self {
            poll_strategy,
            ..Self::default()
        }
    }
}
