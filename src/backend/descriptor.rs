use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// One backend compute node as the balancer sees it.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub address: IpAddr,
    pub port: u16,
    pub static_weight: u32,
    /// Compute (GPU) utilisation, 0.0..=1.0
    pub compute_utilization: f32,
    /// Memory (VRAM) utilisation, 0.0..=1.0
    pub memory_utilization: f32,
    pub warming_up: bool,
    pub warmup_started: Instant,
    /// 0 while warming up, `static_weight` afterwards
    pub effective_weight: u32,
}

impl BackendDescriptor {
    /// A freshly started backend; excluded until its warm-up grace elapses.
    pub fn new(address: IpAddr, port: u16, static_weight: u32) -> Self {
        Self {
            address,
            port,
            static_weight,
            compute_utilization: 0.0,
            memory_utilization: 0.0,
            warming_up: true,
            warmup_started: Instant::now(),
            effective_weight: 0,
        }
    }

    /// A backend that is already serving and skips warm-up.
    pub fn warm(address: IpAddr, port: u16, static_weight: u32) -> Self {
        Self {
            warming_up: false,
            effective_weight: static_weight,
            ..Self::new(address, port, static_weight)
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Clear warm-up once `grace` has passed since it started. Returns true
    /// only on the call that clears it.
    pub fn check_warmup_finished(&mut self, now: Instant, grace: Duration) -> bool {
        if !self.warming_up {
            return false;
        }
        if now.saturating_duration_since(self.warmup_started) < grace {
            return false;
        }
        self.warming_up = false;
        self.effective_weight = self.static_weight;
        true
    }

    /// Weight scaled by free memory headroom. Warming backends score 0.
    pub fn resource_weight(&self) -> f64 {
        if self.warming_up {
            return 0.0;
        }
        (1.0 - self.memory_utilization as f64) * self.effective_weight as f64
    }

    pub fn set_telemetry(&mut self, compute: f32, memory: f32) {
        self.compute_utilization = clamp_unit(compute);
        self.memory_utilization = clamp_unit(memory);
    }
}

// NaN is treated as fully loaded
fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 1.0 } else { v.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_warmup_clears_once() {
        let mut b = BackendDescriptor::new(LOCAL, 9000, 10);
        let start = b.warmup_started;
        let grace = Duration::from_secs(5);

        assert!(!b.check_warmup_finished(start + Duration::from_secs(4), grace));
        assert_eq!(b.effective_weight, 0);
        assert!(b.check_warmup_finished(start + Duration::from_secs(5), grace));
        assert_eq!(b.effective_weight, 10);
        assert!(!b.check_warmup_finished(start + Duration::from_secs(6), grace));
    }

    #[test]
    fn test_resource_weight() {
        let mut b = BackendDescriptor::warm(LOCAL, 9000, 10);
        b.set_telemetry(0.9, 0.25);
        assert!((b.resource_weight() - 7.5).abs() < 1e-6);

        let cold = BackendDescriptor::new(LOCAL, 9001, 10);
        assert_eq!(cold.resource_weight(), 0.0);
    }

    #[test]
    fn test_telemetry_clamped() {
        let mut b = BackendDescriptor::warm(LOCAL, 9000, 1);
        b.set_telemetry(-0.5, f32::NAN);
        assert_eq!(b.compute_utilization, 0.0);
        assert_eq!(b.memory_utilization, 1.0);
        b.set_telemetry(3.0, 0.5);
        assert_eq!(b.compute_utilization, 1.0);
    }
}
