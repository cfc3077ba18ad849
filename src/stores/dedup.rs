//! TTL-bounded processed-id set (C3). Must never return a false positive;
//! false negatives past the TTL are acceptable (§3, §6).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has_processed(&self, id: Uuid) -> Result<bool>;
    /// Must be durable before returning.
    async fn mark_processed(&self, id: Uuid, ttl: Duration) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryDedupStore {
    seen: DashMap<Uuid, Instant>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every entry past its TTL. `has_processed` already evicts
    /// lazily on a miss, but an id that is never looked up again would
    /// otherwise sit in the map forever; a caller drives this periodically
    /// to bound memory for ids that are only ever written once.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.seen.retain(|_, expires_at| *expires_at > now);
    }

    /// Runs [`Self::sweep_expired`] on `interval` until `running` clears.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, interval: Duration, running: std::sync::Arc<std::sync::atomic::AtomicBool>) {
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            tokio::time::sleep(interval).await;
            self.sweep_expired();
        }
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn has_processed(&self, id: Uuid) -> Result<bool> {
        match self.seen.get(&id) {
            Some(expires_at) if Instant::now() < *expires_at => Ok(true),
            Some(_) => {
                // Expired: evict lazily so a miss also reclaims memory,
                // rather than leaving the entry to sit forever.
                self.seen.remove(&id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn mark_processed(&self, id: Uuid, ttl: Duration) -> Result<()> {
        self.seen.insert(id, Instant::now() + ttl);
        Ok(())
    }
}
