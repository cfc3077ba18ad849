//! Cluster coordinator (§4.7, component C7): node registry, heartbeats, and
//! per-partition leader election.
//!
//! Grounded on `original_source/pspf/cluster/coordinator.py`
//! (`ClusterCoordinator`), which layers this over Valkey `SET NX EX` plus a
//! compare-and-expire Lua script. §4.7 is explicit that failure detection
//! here is TTL-based with "no Paxos/Raft" -- `harborgrid-justin-rusty-db`'s
//! `clustering::raft` module is deliberately not a source for this file; the
//! node/health/membership shape in `clustering::node` is.
//!
//! Like the other external collaborators (§4.2-§4.4), this ships only as a
//! trait plus an in-memory reference implementation: production deployments
//! back `ClusterRegistry` with whatever linearisable store they operate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub node_id: Uuid,
    pub host: String,
    pub port: u16,
    /// Unix-epoch seconds at first registration, for operator-facing
    /// diagnostics only; no logic depends on it.
    pub registered_at: i64,
}

#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn register(&self, ttl: Duration) -> Result<()>;
    async fn nodes(&self) -> Result<Vec<NodeInfo>>;
    async fn get_other_nodes(&self) -> Result<Vec<NodeInfo>>;
    async fn leader(&self, partition: u32) -> Result<Option<NodeInfo>>;
    /// Succeeds iff no live leader exists for `partition`, or the caller
    /// already holds it.
    async fn try_lead(&self, partition: u32, ttl: Duration) -> Result<bool>;
    async fn release_partition(&self, partition: u32) -> Result<()>;
    fn self_id(&self) -> Uuid;
}

struct NodeEntry {
    info: NodeInfo,
    expires_at: Instant,
}

struct LeaderEntry {
    node_id: Uuid,
    expires_at: Instant,
}

/// Shared registry backing every node in a simulated cluster (tests run
/// several [`InMemoryClusterRegistry`] handles against one table, the way a
/// real deployment runs several processes against one Valkey instance).
#[derive(Default)]
pub struct ClusterTable {
    nodes: DashMap<Uuid, NodeEntry>,
    leaders: DashMap<u32, LeaderEntry>,
}

impl ClusterTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct InMemoryClusterRegistry {
    table: Arc<ClusterTable>,
    node_id: Uuid,
    host: String,
    port: u16,
}

impl InMemoryClusterRegistry {
    pub fn new(table: Arc<ClusterTable>, host: impl Into<String>, port: u16) -> Self {
        Self {
            table,
            node_id: Uuid::new_v4(),
            host: host.into(),
            port,
        }
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id,
            host: self.host.clone(),
            port: self.port,
            registered_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Runs the node's heartbeat: periodic re-registration plus renewal of
    /// every partition lead it currently holds. Mirrors `_heartbeat_loop`.
    ///
    /// Each sleep is jittered by up to 20% so that a cluster of nodes started
    /// together doesn't keep re-registering in lockstep (same idea as the
    /// discovery backoff in `networking::autodiscovery::gossip`).
    pub async fn run_heartbeat(self: Arc<Self>, ttl: Duration, interval: Duration, held: Vec<u32>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.register(ttl).await {
                tracing::error!(node = %self.node_id, error = %e, "heartbeat registration failed");
            }
            for &partition in &held {
                match self.try_lead(partition, ttl).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(partition, node = %self.node_id, "lost leadership during heartbeat"),
                    Err(e) => tracing::error!(partition, error = %e, "leadership renewal error"),
                }
            }
            tokio::time::sleep(jittered(interval)).await;
        }
    }
}

/// Adds up to 20% random jitter to a base duration.
fn jittered(base: Duration) -> Duration {
    let factor = rand::random_range(1.0..1.2);
    base.mul_f64(factor)
}

#[async_trait]
impl ClusterRegistry for InMemoryClusterRegistry {
    async fn register(&self, ttl: Duration) -> Result<()> {
        self.table.nodes.insert(
            self.node_id,
            NodeEntry {
                info: self.info(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let now = Instant::now();
        Ok(self.table.nodes.iter().filter(|e| e.expires_at > now).map(|e| e.info.clone()).collect())
    }

    async fn get_other_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mine = self.node_id;
        let now = Instant::now();
        Ok(self
            .table
            .nodes
            .iter()
            .filter(|e| e.expires_at > now && e.info.node_id != mine)
            .map(|e| e.info.clone())
            .collect())
    }

    async fn leader(&self, partition: u32) -> Result<Option<NodeInfo>> {
        let now = Instant::now();
        let Some(leader) = self.table.leaders.get(&partition).filter(|e| e.expires_at > now) else {
            return Ok(None);
        };
        let leader_id = leader.node_id;
        Ok(self.table.nodes.get(&leader_id).map(|e| e.info.clone()))
    }

    async fn try_lead(&self, partition: u32, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let acquired = match self.table.leaders.entry(partition) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(LeaderEntry {
                    node_id: self.node_id,
                    expires_at: now + ttl,
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let entry = slot.get();
                if entry.node_id == self.node_id {
                    slot.get_mut().expires_at = now + ttl;
                    true
                } else if entry.expires_at <= now {
                    slot.insert(LeaderEntry {
                        node_id: self.node_id,
                        expires_at: now + ttl,
                    });
                    true
                } else {
                    false
                }
            }
        };
        Ok(acquired)
    }

    async fn release_partition(&self, partition: u32) -> Result<()> {
        self.table.leaders.remove_if(&partition, |_, e| e.node_id == self.node_id);
        Ok(())
    }

    fn self_id(&self) -> Uuid {
        self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_node_leads_a_partition_at_a_time() {
        let table = ClusterTable::new();
        let a = InMemoryClusterRegistry::new(table.clone(), "a", 9000);
        let b = InMemoryClusterRegistry::new(table.clone(), "b", 9001);

        assert!(a.try_lead(0, Duration::from_secs(10)).await.unwrap());
        assert!(!b.try_lead(0, Duration::from_secs(10)).await.unwrap());
        assert_eq!(a.leader(0).await.unwrap().unwrap().node_id, a.self_id());
    }

    #[tokio::test]
    async fn leadership_changes_hands_after_ttl_expiry() {
        let table = ClusterTable::new();
        let a = InMemoryClusterRegistry::new(table.clone(), "a", 9000);
        let b = InMemoryClusterRegistry::new(table.clone(), "b", 9001);

        assert!(a.try_lead(0, Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.try_lead(0, Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn registered_nodes_are_visible_to_peers_but_not_to_self() {
        let table = ClusterTable::new();
        let a = InMemoryClusterRegistry::new(table.clone(), "a", 9000);
        let b = InMemoryClusterRegistry::new(table.clone(), "b", 9001);
        a.register(Duration::from_secs(10)).await.unwrap();
        b.register(Duration::from_secs(10)).await.unwrap();

        let others = a.get_other_nodes().await.unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].node_id, b.self_id());
    }
}
