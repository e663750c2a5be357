//! Target configuration surface.
//!
//! Everything the exchange engine needs to know about one remote target.
//! The struct deserialises from JSON with per-field defaults, so a config
//! document only has to name what it overrides:
//!
//! ```
//! use ipbus_client::TargetConfig;
//!
//! let config = TargetConfig::from_json(r#"{"ip_address": "10.0.0.5"}"#).unwrap();
//! assert_eq!(config.ip_address, "10.0.0.5");
//! assert_eq!(config.remote_port, 50001);
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IpbusError, Result};

/// Default remote IP address.
pub const DEFAULT_IP_ADDRESS: &str = "172.20.75.180";

/// Default IPbus UDP port at the target.
pub const DEFAULT_REMOTE_PORT: u16 = 50001;

/// Default keepalive period in milliseconds.
pub const DEFAULT_UPDATE_PERIOD_MS: u16 = 1000;

/// Default exchange timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u16 = 99;

/// Configuration for one IPbus target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Remote IPv4 address.
    pub ip_address: String,
    /// Remote UDP port.
    pub remote_port: u16,
    /// Local UDP port to bind; 0 asks the OS to pick one.
    pub local_port: u16,
    /// Keepalive period in milliseconds.
    pub update_period_ms: u16,
    /// Timeout for each bounded socket operation, in milliseconds.
    ///
    /// This is a tunable, not a protocol constant; raise it for targets
    /// behind slow links.
    pub timeout_ms: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            ip_address: DEFAULT_IP_ADDRESS.to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            local_port: 0,
            update_period_ms: DEFAULT_UPDATE_PERIOD_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl TargetConfig {
    /// Configuration for a target at `ip_address` with all other fields
    /// at their defaults.
    pub fn for_address(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| IpbusError::Logic(format!("invalid target config: {e}")))
    }

    /// The remote socket address.
    ///
    /// # Errors
    ///
    /// `Logic` when `ip_address` does not parse as an IP address.
    pub fn remote_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .ip_address
            .parse()
            .map_err(|e| IpbusError::Logic(format!("invalid ip_address {:?}: {e}", self.ip_address)))?;
        Ok(SocketAddr::new(ip, self.remote_port))
    }

    /// The exchange timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }

    /// The keepalive period as a [`Duration`].
    pub fn update_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.update_period_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TargetConfig::default();
        assert_eq!(config.ip_address, "172.20.75.180");
        assert_eq!(config.remote_port, 50001);
        assert_eq!(config.local_port, 0);
        assert_eq!(config.update_period_ms, 1000);
        assert_eq!(config.timeout_ms, 99);
        assert_eq!(config.timeout(), Duration::from_millis(99));
        assert_eq!(config.update_period(), Duration::from_millis(1000));
    }

    #[test]
    fn test_from_json_partial() {
        let config = TargetConfig::from_json(r#"{"timeout_ms": 250, "local_port": 50010}"#).unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.local_port, 50010);
        assert_eq!(config.ip_address, DEFAULT_IP_ADDRESS);
    }

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        assert!(TargetConfig::from_json(r#"{"ip": "10.0.0.1"}"#).is_err());
    }

    #[test]
    fn test_remote_addr() {
        let config = TargetConfig::for_address("127.0.0.1");
        assert_eq!(config.remote_addr().unwrap().to_string(), "127.0.0.1:50001");

        let bad = TargetConfig::for_address("not-an-ip");
        assert!(matches!(bad.remote_addr(), Err(IpbusError::Logic(_))));
    }
}
