pub mod descriptor;
pub mod health;
pub mod policy;
pub mod pool;

pub use descriptor::BackendDescriptor;
pub use health::{AlwaysHealthy, HealthCheck, HealthMonitor};
pub use policy::Policy;
pub use pool::{BackendId, BackendStatus, LoadBalancer, SelectedBackend};
