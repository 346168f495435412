use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    #[default]
    RoundRobin,
    LeastConnections,
    /// Highest `(1 - memory) * weight` wins
    ResourceAware,
    /// Client key hashed onto the eligible set
    Affinity,
}

impl Policy {
    pub fn name(self) -> &'static str {
        match self {
            Policy::RoundRobin => "round-robin",
            Policy::LeastConnections => "least-connections",
            Policy::ResourceAware => "resource-aware",
            Policy::Affinity => "affinity",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Policy::RoundRobin),
            "least-connections" => Ok(Policy::LeastConnections),
            "resource-aware" => Ok(Policy::ResourceAware),
            "affinity" => Ok(Policy::Affinity),
            other => Err(Error::Config(format!("unknown balancing policy '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("least_connections".parse::<Policy>().unwrap(), Policy::LeastConnections);
        assert_eq!(" Affinity ".parse::<Policy>().unwrap(), Policy::Affinity);
        assert!(matches!("random".parse::<Policy>(), Err(Error::Config(_))));
    }
}
