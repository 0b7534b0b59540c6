use std::collections::BTreeSet;
use std::time::Duration;

pub const DEFAULT_LOG_CEILING_BYTES: u64 = 1 << 20;
pub const DEFAULT_METADATA_VALUE_CAP: usize = 32 << 10;
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_DEBOUNCE_MAX_DELAY: Duration = Duration::from_secs(4);
pub const DEFAULT_WATCHER_CAPACITY: usize = 64;
pub const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_PORT_CACHE_TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TROUBLESHOOTING_URL: &str = "/docs/templates#troubleshooting-agents";
pub const MINIMUM_LISTENING_PORT: u16 = 9;

/// Well-known infrastructure ports never surfaced as workspace ports. Ports
/// 1-8 are reserved for the agent itself.
pub const IGNORED_LISTENING_PORTS: &[u16] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, // agent reserved
    20, 21, // ftp
    22,  // ssh
    23,  // telnet
    25,  // smtp
    53,  // dns
    110, // pop3
    143, // imap
    179, // bgp
    389, 636, // ldap
    465, 587, // smtp submission
    989, 990, // ftps
    993,  // imaps
    995,  // pop3s
    3306, // mysql
    3389, // rdp
    5432, // postgres
    27017, 27018, 27019, 28017, // mongodb
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortFilterRule {
    pub min_port: u16,
    pub ignored: BTreeSet<u16>,
}

impl PortFilterRule {
    pub fn allows(&self, port: u16) -> bool {
        port >= self.min_port && !self.ignored.contains(&port)
    }
}

impl Default for PortFilterRule {
    fn default() -> Self {
        Self {
            min_port: MINIMUM_LISTENING_PORT,
            ignored: IGNORED_LISTENING_PORTS.iter().copied().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub log_ceiling_bytes: u64,
    pub metadata_value_cap: usize,
    pub debounce_window: Duration,
    /// Upper bound on how long a steady stream of writes can hold back an
    /// emission.
    pub debounce_max_delay: Duration,
    pub watcher_capacity: usize,
    pub inactivity_window: Duration,
    pub port_filter: PortFilterRule,
    pub port_cache_ttl: Duration,
    pub dial_timeout: Duration,
    pub stats_interval: Duration,
    pub default_troubleshooting_url: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            log_ceiling_bytes: DEFAULT_LOG_CEILING_BYTES,
            metadata_value_cap: DEFAULT_METADATA_VALUE_CAP,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            debounce_max_delay: DEFAULT_DEBOUNCE_MAX_DELAY,
            watcher_capacity: DEFAULT_WATCHER_CAPACITY,
            inactivity_window: DEFAULT_INACTIVITY_WINDOW,
            port_filter: PortFilterRule::default(),
            port_cache_ttl: DEFAULT_PORT_CACHE_TTL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            default_troubleshooting_url: DEFAULT_TROUBLESHOOTING_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_drops_reserved_and_infrastructure_ports() {
        let rule = PortFilterRule::default();
        assert!(!rule.allows(0));
        assert!(!rule.allows(8));
        assert!(!rule.allows(22));
        assert!(!rule.allows(5432));
        assert!(rule.allows(9));
        assert!(rule.allows(3000));
        assert!(rule.allows(8080));
    }
}
