//! Runtime configuration knobs (spec §6.3), with env-var overrides
//! following the teacher's CLI-arg-then-env-var precedence.

use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 3);
pub const DEFAULT_MULTICAST_PORT: u16 = 7570;
pub const DEFAULT_PEER_PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUNDLE_FLUSH_THRESHOLD: usize = 8192;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub interface: Option<String>,
    pub peer_ping_timeout: Duration,
    pub bundle_flush_threshold: usize,
    pub default_subscriber_lease: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            interface: None,
            peer_ping_timeout: DEFAULT_PEER_PING_TIMEOUT,
            bundle_flush_threshold: DEFAULT_BUNDLE_FLUSH_THRESHOLD,
            default_subscriber_lease: None,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_multicast_group(mut self, group: Ipv4Addr) -> Self {
        self.multicast_group = group;
        self
    }

    pub fn with_multicast_port(mut self, port: u16) -> Self {
        self.multicast_port = port;
        self
    }

    pub fn with_interface(mut self, iface: impl Into<String>) -> Self {
        self.interface = Some(iface.into());
        self
    }

    pub fn with_peer_ping_timeout(mut self, timeout: Duration) -> Self {
        self.peer_ping_timeout = timeout;
        self
    }

    /// Apply `MAPPER_MULTICAST_ADDR` (`group:port`) and `MAPPER_INTERFACE`
    /// overrides, if set, matching the teacher's env-override-after-args
    /// precedence (`parse_database_url`-style: explicit construction first,
    /// environment last).
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("MAPPER_MULTICAST_ADDR") {
            if let Some((group, port)) = addr.split_once(':') {
                if let (Ok(g), Ok(p)) = (group.parse(), port.parse()) {
                    self.multicast_group = g;
                    self.multicast_port = p;
                }
            }
        }
        if let Ok(iface) = std::env::var("MAPPER_INTERFACE") {
            self.interface = Some(iface);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = DeviceConfig::new();
        assert_eq!(cfg.multicast_group, Ipv4Addr::new(224, 0, 1, 3));
        assert_eq!(cfg.multicast_port, 7570);
        assert_eq!(cfg.bundle_flush_threshold, 8192);
    }

    #[test]
    fn builder_overrides_stack() {
        let cfg = DeviceConfig::new()
            .with_multicast_port(9000)
            .with_interface("eth0");
        assert_eq!(cfg.multicast_port, 9000);
        assert_eq!(cfg.interface.as_deref(), Some("eth0"));
    }
}
