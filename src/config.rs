//! Bootstrap configuration
//!
//! Read once at startup from a TOML file; every field has a default so an
//! empty file (or no file at all) yields a runnable gateway.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{BackendDescriptor, Policy};
use crate::core::constants;
use crate::error::{Error, Result};
use crate::poll::PollStrategyKind;
use crate::worker::LoopConfig;

pub const CONFIG_ENV: &str = "GATEWAY_CONFIG";
pub const POLLER_ENV: &str = "GATEWAY_POLLER";
pub const POLICY_ENV: &str = "GATEWAY_POLICY";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Worker threads; 0 means one per core.
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub poll_strategy: PollStrategyKind,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    #[serde(default = "default_priority_marker")]
    pub priority_marker: String,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default = "default_warmup_grace_ms")]
    pub warmup_grace_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_ring_entries")]
    pub ring_entries: u32,
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Skip warm-up; the backend is eligible immediately.
    #[serde(default)]
    pub warm: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    constants::DEFAULT_POLL_TIMEOUT_MS
}

fn default_read_buffer_size() -> usize {
    constants::READ_BUF
}

fn default_max_channels() -> usize {
    constants::DEFAULT_MAX_CHANNELS
}

fn default_priority_marker() -> String {
    constants::PRIORITY_MARKER.to_string()
}

fn default_warmup_grace_ms() -> u64 {
    constants::DEFAULT_WARMUP_GRACE_MS
}

fn default_health_interval_ms() -> u64 {
    constants::DEFAULT_HEALTH_INTERVAL_MS
}

fn default_ring_entries() -> u32 {
    constants::DEFAULT_RING_ENTRIES
}

fn default_weight() -> u32 {
    1
}

fn default_backends() -> Vec<BackendConfig> {
    (9001..=9003)
        .map(|port| BackendConfig {
            address: "127.0.0.1".to_string(),
            port,
            weight: default_weight(),
            warm: false,
        })
        .collect()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            poll_strategy: PollStrategyKind::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
            max_channels: default_max_channels(),
            priority_marker: default_priority_marker(),
            policy: Policy::default(),
            warmup_grace_ms: default_warmup_grace_ms(),
            health_interval_ms: default_health_interval_ms(),
            ring_entries: default_ring_entries(),
            backends: default_backends(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Resolve the configuration the way the binary does: path from the first
    /// argument, else `GATEWAY_CONFIG`, else defaults; then env overrides and
    /// validation.
    pub fn from_args_env(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let path = args.next().or_else(|| std::env::var(CONFIG_ENV).ok());
        let mut config = match path {
            Some(p) => Self::load(Path::new(&p))?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(POLLER_ENV) {
            self.poll_strategy = v.parse()?;
        }
        if let Some(v) = lookup(POLICY_ENV) {
            self.policy = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be positive".into()));
        }
        if self.max_channels == 0 {
            return Err(Error::Config("max_channels must be positive".into()));
        }
        if self.ring_entries == 0 {
            return Err(Error::Config("ring_entries must be positive".into()));
        }
        if self.priority_marker.is_empty() {
            return Err(Error::Config("priority_marker must not be empty".into()));
        }
        for b in &self.backends {
            if b.weight == 0 {
                return Err(Error::Config(format!("backend {}:{} has zero weight", b.address, b.port)));
            }
            b.ip()?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen address '{}'", self.listen)))
    }

    pub fn warmup_grace(&self) -> Duration {
        Duration::from_millis(self.warmup_grace_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            poll_strategy: self.poll_strategy,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            read_buffer_size: self.read_buffer_size,
            max_channels: self.max_channels,
            ring_entries: self.ring_entries,
            priority_marker: self.priority_marker.clone(),
            ..LoopConfig::default()
        }
    }

    pub fn backend_descriptors(&self) -> Result<Vec<BackendDescriptor>> {
        self.backends
            .iter()
            .map(|b| {
                let ip = b.ip()?;
                Ok(if b.warm {
                    BackendDescriptor::warm(ip, b.port, b.weight)
                } else {
                    BackendDescriptor::new(ip, b.port, b.weight)
                })
            })
            .collect()
    }
}

impl BackendConfig {
    fn ip(&self) -> Result<IpAddr> {
        self.address
            .parse()
            .map_err(|_| Error::Config(format!("invalid backend address '{}'", self.address)))
    }
}
