//! Tunables enumerated in the external-interfaces configuration table.

use std::time::Duration;

/// Runtime configuration for a `fluxlog` node.
///
/// Every field corresponds to one row of the configuration table; defaults
/// match the spec exactly.
#[derive(Debug, Clone)]
pub struct FluxConfig {
    /// Partitions created by `hash(key) mod num_partitions`. Default 4.
    pub num_partitions: u32,
    /// Rotate the active segment once it reaches this size. Default 100 MiB.
    pub max_segment_size: u64,
    /// TTL of dedup entries. Default 24h.
    pub dedup_ttl: Duration,
    /// TTL of partition leases. Default 10s.
    pub lease_ttl: Duration,
    /// Lease renewal cadence; must be `<= lease_ttl / 3`. Default 2s.
    pub lease_renew_interval: Duration,
    /// Node registration TTL. Default 10s.
    pub node_heartbeat_ttl: Duration,
    /// Node registration refresh cadence. Default 3s.
    pub node_heartbeat_interval: Duration,
    /// Idle sleep when a partition has no new records. Default 100ms.
    pub poll_interval: Duration,
    /// Bound on each operator's inbox. Default 100.
    pub inbox_capacity: usize,
    /// Checkpoint cadence; zero disables periodic checkpointing.
    pub checkpoint_interval: Duration,
    /// Per-peer replication RPC deadline. Default 2s.
    pub replication_timeout: Duration,
    /// Redeliveries tolerated before a record is routed to the dead-letter
    /// sink instead of retried indefinitely. Default 5.
    pub max_redeliveries: u32,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            num_partitions: 4,
            max_segment_size: 100 * 1024 * 1024,
            dedup_ttl: Duration::from_secs(86_400),
            lease_ttl: Duration::from_secs(10),
            lease_renew_interval: Duration::from_secs(2),
            node_heartbeat_ttl: Duration::from_secs(10),
            node_heartbeat_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
            inbox_capacity: 100,
            checkpoint_interval: Duration::from_secs(0),
            replication_timeout: Duration::from_secs(2),
            max_redeliveries: 5,
        }
    }
}

impl FluxConfig {
    pub fn partition_of(&self, key: &[u8]) -> u32 {
        hash_partition(key, self.num_partitions)
    }
}

/// `hash(key) mod num_partitions`, shared by [`FluxConfig::partition_of`]
/// and [`crate::log::PartitionedLog::append`] so both agree on assignment.
pub fn hash_partition(key: &[u8], num_partitions: u32) -> u32 {
    crc32fast::hash(key) % num_partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_table() {
        let cfg = FluxConfig::default();
        assert_eq!(cfg.num_partitions, 4);
        assert_eq!(cfg.max_segment_size, 100 * 1024 * 1024);
        assert_eq!(cfg.lease_ttl, Duration::from_secs(10));
        assert_eq!(cfg.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn partition_of_is_stable() {
        let cfg = FluxConfig::default();
        let p1 = cfg.partition_of(b"order-42");
        let p2 = cfg.partition_of(b"order-42");
        assert_eq!(p1, p2);
        assert!(p1 < cfg.num_partitions);
    }
}
