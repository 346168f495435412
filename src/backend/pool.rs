use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::util::hash::stable_hash;

use super::descriptor::BackendDescriptor;
use super::policy::Policy;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BackendId(pub usize);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of a selection. Carries the backend's live counter so opening and
/// closing a connection never touch the selection lock.
#[derive(Debug, Clone)]
pub struct SelectedBackend {
    pub id: BackendId,
    pub addr: SocketAddr,
    live: Arc<AtomicUsize>,
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStatus {
    pub id: BackendId,
    pub addr: SocketAddr,
    pub static_weight: u32,
    pub effective_weight: u32,
    pub compute_utilization: f32,
    pub memory_utilization: f32,
    pub warming_up: bool,
    pub healthy: bool,
    pub live_connections: usize,
}

struct Node {
    descriptor: BackendDescriptor,
    healthy: bool,
    live: Arc<AtomicUsize>,
}

/// Backend set plus the four selection policies.
///
/// Selection, warm-up transitions and telemetry updates serialise on one
/// mutex. The round-robin cursor and the connection counters are atomics.
pub struct LoadBalancer {
    nodes: Mutex<Vec<Node>>,
    cursor: AtomicUsize,
    policy: Policy,
    warmup_grace: Duration,
    total_live: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(policy: Policy, warmup_grace: Duration) -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            policy,
            warmup_grace,
            total_live: AtomicUsize::new(0),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, Vec<Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn add_backend(&self, descriptor: BackendDescriptor) -> BackendId {
        let mut nodes = self.nodes();
        let id = BackendId(nodes.len());
        info!(
            backend = %id,
            addr = %descriptor.socket_addr(),
            weight = descriptor.static_weight,
            warming_up = descriptor.warming_up,
            "backend added"
        );
        nodes.push(Node {
            descriptor,
            healthy: true,
            live: Arc::new(AtomicUsize::new(0)),
        });
        id
    }

    pub fn backend_count(&self) -> usize {
        self.nodes().len()
    }

    /// Pick a backend with the active policy. `key` is the affinity key and
    /// is ignored by the other policies.
    pub fn select_backend(&self, key: Option<&[u8]>) -> Result<SelectedBackend> {
        self.select_with(self.policy, key, Instant::now())
    }

    /// As `select_backend`, evaluating warm-up against `now`.
    pub fn select_backend_at(&self, key: Option<&[u8]>, now: Instant) -> Result<SelectedBackend> {
        self.select_with(self.policy, key, now)
    }

    /// Affinity selection regardless of the active policy.
    pub fn select_by_origin(&self, key: &[u8]) -> Result<SelectedBackend> {
        self.select_with(Policy::Affinity, Some(key), Instant::now())
    }

    fn select_with(&self, policy: Policy, key: Option<&[u8]>, now: Instant) -> Result<SelectedBackend> {
        let mut nodes = self.nodes();

        let mut eligible = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter_mut().enumerate() {
            if node.descriptor.check_warmup_finished(now, self.warmup_grace) {
                info!(backend = i, "warm-up finished, backend eligible");
            }
            if !node.descriptor.warming_up && node.healthy {
                eligible.push(i);
            }
        }
        if eligible.is_empty() {
            return Err(Error::NoEligibleBackend);
        }

        let chosen = match (policy, key) {
            (Policy::RoundRobin, _) | (Policy::Affinity, None) => {
                let n = self.cursor.fetch_add(1, Ordering::Relaxed);
                eligible[n % eligible.len()]
            }
            (Policy::LeastConnections, _) => eligible
                .iter()
                .copied()
                .min_by_key(|&i| nodes[i].live.load(Ordering::Acquire))
                .unwrap_or(eligible[0]),
            (Policy::ResourceAware, _) => {
                let mut best = eligible[0];
                let mut best_weight = nodes[best].descriptor.resource_weight();
                for &i in &eligible[1..] {
                    let w = nodes[i].descriptor.resource_weight();
                    if w > best_weight {
                        best = i;
                        best_weight = w;
                    }
                }
                best
            }
            (Policy::Affinity, Some(key)) => {
                let slot = stable_hash(key) % eligible.len() as u64;
                eligible[slot as usize]
            }
        };

        let node = &nodes[chosen];
        debug!(backend = chosen, policy = %policy, eligible = eligible.len(), "backend selected");
        Ok(SelectedBackend {
            id: BackendId(chosen),
            addr: node.descriptor.socket_addr(),
            live: Arc::clone(&node.live),
        })
    }

    /// The total is raised before the backend's counter, so a decrement
    /// that sees the backend counter raised always finds the total raised too.
    pub fn incr_conn_count(&self, backend: &SelectedBackend) {
        self.total_live.fetch_add(1, Ordering::AcqRel);
        backend.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Fails without touching the counter if it is already zero.
    pub fn decr_conn_count(&self, backend: &SelectedBackend) -> Result<()> {
        if backend
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            error!(backend = %backend.id, "connection count released more often than acquired");
            return Err(Error::InvariantViolation(format!(
                "connection counter underflow on backend {}",
                backend.id
            )));
        }
        if self
            .total_live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            error!(backend = %backend.id, "total connection count out of step with backend counters");
            return Err(Error::InvariantViolation(
                "total connection counter underflow".to_string(),
            ));
        }
        Ok(())
    }

    pub fn live_connections(&self, id: BackendId) -> Result<usize> {
        let nodes = self.nodes();
        let node = nodes.get(id.0).ok_or(Error::UnknownBackend(id.0))?;
        Ok(node.live.load(Ordering::Acquire))
    }

    pub fn total_live_connections(&self) -> usize {
        self.total_live.load(Ordering::Acquire)
    }

    /// Apply a telemetry sample; values are clamped to 0.0..=1.0.
    pub fn update_telemetry(&self, id: BackendId, compute: f32, memory: f32) -> Result<()> {
        let mut nodes = self.nodes();
        let node = nodes.get_mut(id.0).ok_or(Error::UnknownBackend(id.0))?;
        node.descriptor.set_telemetry(compute, memory);
        debug!(backend = %id, compute, memory, "telemetry updated");
        Ok(())
    }

    pub fn set_healthy(&self, id: BackendId, healthy: bool) -> Result<()> {
        let mut nodes = self.nodes();
        let node = nodes.get_mut(id.0).ok_or(Error::UnknownBackend(id.0))?;
        if node.healthy != healthy {
            info!(backend = %id, healthy, "backend health changed");
        }
        node.healthy = healthy;
        Ok(())
    }

    pub fn backend(&self, id: BackendId) -> Option<BackendDescriptor> {
        self.nodes().get(id.0).map(|n| n.descriptor.clone())
    }

    pub fn snapshot(&self) -> Vec<BackendStatus> {
        self.nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| BackendStatus {
                id: BackendId(i),
                addr: n.descriptor.socket_addr(),
                static_weight: n.descriptor.static_weight,
                effective_weight: n.descriptor.effective_weight,
                compute_utilization: n.descriptor.compute_utilization,
                memory_utilization: n.descriptor.memory_utilization,
                warming_up: n.descriptor.warming_up,
                healthy: n.healthy,
                live_connections: n.live.load(Ordering::Acquire),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn warm_lb(policy: Policy, n: u8) -> LoadBalancer {
        let lb = LoadBalancer::new(policy, Duration::from_secs(5));
        for i in 0..n {
            lb.add_backend(BackendDescriptor::warm(ip(i + 1), 9000, 10));
        }
        lb
    }

    #[test]
    fn test_empty_set_is_not_eligible() {
        let lb = warm_lb(Policy::RoundRobin, 0);
        assert!(matches!(lb.select_backend(None), Err(Error::NoEligibleBackend)));
    }

    #[test]
    fn test_resource_aware_prefers_headroom() {
        let lb = warm_lb(Policy::ResourceAware, 3);
        lb.update_telemetry(BackendId(0), 0.1, 0.9).unwrap();
        lb.update_telemetry(BackendId(1), 0.9, 0.2).unwrap();
        lb.update_telemetry(BackendId(2), 0.1, 0.5).unwrap();
        assert_eq!(lb.select_backend(None).unwrap().id, BackendId(1));
    }

    #[test]
    fn test_resource_aware_tie_takes_first() {
        let lb = warm_lb(Policy::ResourceAware, 3);
        assert_eq!(lb.select_backend(None).unwrap().id, BackendId(0));
    }

    #[test]
    fn test_unhealthy_excluded() {
        let lb = warm_lb(Policy::RoundRobin, 2);
        lb.set_healthy(BackendId(0), false).unwrap();
        for _ in 0..4 {
            assert_eq!(lb.select_backend(None).unwrap().id, BackendId(1));
        }
        lb.set_healthy(BackendId(1), false).unwrap();
        assert!(matches!(lb.select_backend(None), Err(Error::NoEligibleBackend)));
    }

    #[test]
    fn test_affinity_without_key_round_robins() {
        let lb = warm_lb(Policy::Affinity, 2);
        let a = lb.select_backend(None).unwrap().id;
        let b = lb.select_backend(None).unwrap().id;
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_backend() {
        let lb = warm_lb(Policy::RoundRobin, 1);
        assert!(matches!(
            lb.update_telemetry(BackendId(7), 0.0, 0.0),
            Err(Error::UnknownBackend(7))
        ));
        assert!(lb.live_connections(BackendId(7)).is_err());
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let lb = warm_lb(Policy::RoundRobin, 2);
        let sel = lb.select_backend(None).unwrap();
        lb.incr_conn_count(&sel);
        let snap = lb.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[sel.id.0].live_connections, 1);
        assert_eq!(lb.total_live_connections(), 1);
    }

    #[test]
    fn test_failed_release_leaves_total_untouched() {
        let lb = warm_lb(Policy::RoundRobin, 2);
        let a = lb.select_backend(None).unwrap();
        let b = lb.select_backend(None).unwrap();
        lb.incr_conn_count(&a);

        assert!(matches!(lb.decr_conn_count(&b), Err(Error::InvariantViolation(_))));
        assert_eq!(lb.total_live_connections(), 1);
        lb.decr_conn_count(&a).unwrap();
        assert_eq!(lb.total_live_connections(), 0);
    }
}
