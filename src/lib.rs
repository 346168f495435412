//! gatehouse: readiness-loop core and backend balancer for a small edge gateway.

pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod poll;
pub mod protocol;
pub mod util;
pub mod worker;

pub use error::{Error, Result};
