use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Externally supplied tuning for a mesh node.
///
/// Every long-lived loop takes its cadence from here; nothing reads global
/// state, so several differently-configured nodes can share one process.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Explicit bind address; probed from the default route when `None`.
    pub bind_ip: Option<IpAddr>,
    /// Explicit publisher port; sampled from `port_range` when `None`.
    pub bind_port: Option<u16>,
    pub port_range: RangeInclusive<u16>,
    /// Bounded wait used by polling loops so a stop signal is observed
    /// within one interval.
    pub poll_timeout: Duration,

    /// Well-known UDP port presence announcements are exchanged on.
    pub discovery_port: u16,
    pub broadcast_interval: Duration,
    /// Where presence datagrams are sent. Defaults to the /24 subnet
    /// broadcast address on `discovery_port`.
    pub broadcast_target: Option<SocketAddr>,
    /// 4-byte pre-shared XOR key; wrong length fails node startup.
    pub obfuscation_key: Vec<u8>,
    /// Address the throwaway outbound-IP probe socket connects toward.
    pub probe_addr: SocketAddr,

    pub election_timeout: Duration,
    pub election_check: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            bind_port: None,
            port_range: 5000..=6000,
            poll_timeout: Duration::from_millis(1000),
            discovery_port: 9999,
            broadcast_interval: Duration::from_secs(1),
            broadcast_target: None,
            obfuscation_key: b"abcd".to_vec(),
            probe_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80),
            election_timeout: Duration::from_secs(5),
            election_check: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = MeshConfig::default();
        assert!(config.port_range.contains(&5500));
        assert_eq!(config.obfuscation_key.len(), 4);
        assert!(config.election_timeout > config.heartbeat_interval);
    }
}
