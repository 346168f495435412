pub const READ_BUF: usize = 4096;

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_CHANNELS: usize = 4096;
pub const DEFAULT_RING_ENTRIES: u32 = 256;
pub const INITIAL_EVENT_CAPACITY: usize = 1024;

pub const PRIORITY_MARKER: &str = "X-Priority: High";

pub const DEFAULT_WARMUP_GRACE_MS: u64 = 5000;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 10_000;

pub const LISTEN_BACKLOG: i32 = 1024;
