//! Per-thread readiness loop and its task plumbing.

pub mod acceptor;
pub mod channel_pool;
pub mod config;
pub mod event_loop;
pub mod handler;
pub mod handlers;
pub mod task;

pub use crate::core::socket::ReadOutcome;
pub use acceptor::Acceptor;
pub use channel_pool::ChannelArena;
pub use config::LoopConfig;
pub use event_loop::{ConnectionInbox, EventLoop, LoopStats};
pub use handler::{Disposition, TaskHandler};
pub use handlers::GatewayHandler;
pub use task::{Priority, PriorityMarker, Task, TaskQueue};
