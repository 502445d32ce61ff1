//! Router configuration.
//!
//! The transport layer owns option parsing; this struct is the set of knobs
//! the core recognizes, with the defaults it falls back to when an option is
//! absent. All fields are independently defaultable so the transport can
//! deserialize a partial document.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interface name that faces the NAT-internal network.
pub const DEFAULT_INTERNAL_INTERFACE: &str = "eth1";

/// Core router options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Enable the NAPT gateway on top of plain forwarding.
    pub nat_enabled: bool,
    /// Name of the NAT-internal interface; all others are external.
    pub internal_interface: String,
    /// Idle expiry for ICMP query mappings, in seconds.
    pub icmp_timeout_s: u64,
    /// Idle expiry for established TCP connections, in seconds.
    pub tcp_established_timeout_s: u64,
    /// Idle expiry for non-established TCP connections, in seconds.
    pub tcp_transitory_timeout_s: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            nat_enabled: false,
            internal_interface: DEFAULT_INTERNAL_INTERFACE.to_string(),
            icmp_timeout_s: 60,
            tcp_established_timeout_s: 7440,
            tcp_transitory_timeout_s: 300,
        }
    }
}

impl RouterConfig {
    pub fn icmp_timeout(&self) -> Duration {
        Duration::from_secs(self.icmp_timeout_s)
    }

    pub fn tcp_established_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_established_timeout_s)
    }

    pub fn tcp_transitory_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_transitory_timeout_s)
    }
}
