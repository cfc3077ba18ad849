//! Durable consumer-group offsets (C2).

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn get(&self, group: &str, partition: u32) -> Result<Option<u64>>;
    /// Must be durable before returning; monotonicity is the caller's
    /// responsibility, not the store's.
    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()>;
}

/// Process-local offset store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: DashMap<(String, u32), u64>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn get(&self, group: &str, partition: u32) -> Result<Option<u64>> {
        Ok(self.offsets.get(&(group.to_string(), partition)).map(|v| *v))
    }

    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()> {
        self.offsets.insert((group.to_string(), partition), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_offset_reads_as_none() {
        let store = InMemoryOffsetStore::new();
        assert_eq!(store.get("g", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn commit_then_get_round_trips() {
        let store = InMemoryOffsetStore::new();
        store.commit("g", 0, 5).await.unwrap();
        assert_eq!(store.get("g", 0).await.unwrap(), Some(5));
    }
}
