//! Timing and capacity settings shared by both server roles

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Debounce delay for game server → master deltas
    pub game_flush_delay: Duration,
    /// Debounce delay for master → client deltas
    pub client_flush_delay: Duration,
    /// Debounce delay for snapshots written to storage
    pub persist_delay: Duration,
    /// How long a released profile stays cached
    pub grace_period: Duration,
    /// Run loop tick driving every flush timer
    pub tick_interval: Duration,
    /// Silence after which a peer counts as gone
    pub peer_timeout: Duration,
    /// How often the master retries loading profiles storage failed to return
    pub restore_retry: Duration,
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            game_flush_delay: Duration::from_millis(100),
            client_flush_delay: Duration::from_millis(250),
            persist_delay: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            tick_interval: Duration::from_millis(20),
            peer_timeout: Duration::from_secs(5),
            restore_retry: Duration::from_secs(5),
            max_peers: 64,
        }
    }
}

impl NodeConfig {
    /// Builds a config from millisecond values, as given on the command line.
    pub fn from_millis(game_flush: u64, client_flush: u64, persist: u64, grace: u64, tick: u64) -> Self {
        Self {
            game_flush_delay: Duration::from_millis(game_flush),
            client_flush_delay: Duration::from_millis(client_flush),
            persist_delay: Duration::from_millis(persist),
            grace_period: Duration::from_millis(grace),
            tick_interval: Duration::from_millis(tick.max(1)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.game_flush_delay, Duration::from_millis(100));
        assert_eq!(config.client_flush_delay, Duration::from_millis(250));
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.restore_retry, Duration::from_secs(5));
    }

    #[test]
    fn test_from_millis_keeps_tick_positive() {
        let config = NodeConfig::from_millis(10, 20, 30, 40, 0);
        assert_eq!(config.persist_delay, Duration::from_millis(30));
        assert_eq!(config.tick_interval, Duration::from_millis(1));
        assert_eq!(config.max_peers, NodeConfig::default().max_peers);
    }
}
