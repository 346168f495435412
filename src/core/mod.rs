pub mod buffer_pool;
pub mod channel;
pub mod constants;
pub mod socket;
pub mod token;

pub use buffer_pool::BufferPool;
pub use channel::{Channel, ChannelHandle, ChannelRole, Interest, Readiness};
