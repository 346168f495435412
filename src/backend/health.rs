use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::pool::{BackendStatus, LoadBalancer};

/// Check deciding whether a backend should stay in the eligible set.
pub trait HealthCheck: Send + Sync {
    fn check(&self, backend: &BackendStatus) -> bool;
}

/// Reports every backend healthy.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysHealthy;

impl HealthCheck for AlwaysHealthy {
    fn check(&self, _backend: &BackendStatus) -> bool {
        true
    }
}

impl<F> HealthCheck for F
where
    F: Fn(&BackendStatus) -> bool + Send + Sync,
{
    fn check(&self, backend: &BackendStatus) -> bool {
        self(backend)
    }
}

/// Runs a `HealthCheck` against every backend, off the loop threads.
pub struct HealthMonitor {
    lb: Arc<LoadBalancer>,
    check: Arc<dyn HealthCheck>,
}

impl HealthMonitor {
    pub fn new(lb: Arc<LoadBalancer>, check: Arc<dyn HealthCheck>) -> Self {
        Self { lb, check }
    }

    /// One check round. Returns the number of healthy backends.
    pub fn run_once(&self) -> usize {
        let mut healthy = 0;
        for status in self.lb.snapshot() {
            let ok = self.check.check(&status);
            if ok {
                healthy += 1;
            }
            if let Err(e) = self.lb.set_healthy(status.id, ok) {
                debug!(backend = %status.id, error = %e, "health result not applied");
            }
        }
        debug!(healthy, total = self.lb.backend_count(), "health round done");
        healthy
    }

    /// Check every `interval` on a background thread until `shutdown` is set.
    pub fn spawn(self, interval: Duration, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("health-monitor".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "health monitor started");
                while !shutdown.load(Ordering::Acquire) {
                    self.run_once();
                    let deadline = Instant::now() + interval;
                    while !shutdown.load(Ordering::Acquire) {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        thread::sleep((deadline - now).min(Duration::from_millis(100)));
                    }
                }
                info!("health monitor stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendDescriptor, BackendId, Policy};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_failed_check_removes_backend() {
        let lb = Arc::new(LoadBalancer::new(Policy::RoundRobin, Duration::from_secs(5)));
        for port in [9000, 9001] {
            lb.add_backend(BackendDescriptor::warm(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1));
        }

        let monitor = HealthMonitor::new(
            Arc::clone(&lb),
            Arc::new(|b: &BackendStatus| b.addr.port() != 9000),
        );
        assert_eq!(monitor.run_once(), 1);
        for _ in 0..3 {
            assert_eq!(lb.select_backend(None).unwrap().id, BackendId(1));
        }
    }

    #[test]
    fn test_spawned_monitor_stops() {
        let lb = Arc::new(LoadBalancer::new(Policy::RoundRobin, Duration::from_secs(5)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = HealthMonitor::new(lb, Arc::new(AlwaysHealthy))
            .spawn(Duration::from_secs(60), Arc::clone(&shutdown))
            .unwrap();
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
