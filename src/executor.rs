//! Partitioned executor (§4.6, component C6): wires dedup, lease ownership,
//! and poison-pill quarantine into the [`Emitter`] chain a [`LogSource`]
//! drives.
//!
//! Grounded on `original_source/pspf/runtime/executor.py`
//! (`PartitionedExecutor`), but restructured around the redesign the spec
//! calls for: the original reassigns `self.source.emit` at `start()` time
//! and leaves the lease check as a `pass`-stubbed no-op comment ("In a
//! full-scale system, losing a lease should pause the consumer at the
//! source level"). Here that pause is real -- [`LeaseOwnership`] is a
//! [`PartitionGate`] the source polls directly -- and dedup is plain
//! composition, not attribute surgery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::emitter::Emitter;
use crate::error::Result;
use crate::record::Record;
use crate::source::PartitionGate;
use crate::stores::{DedupStore, LeaseManager};

/// Tracks which partitions this process currently believes it owns, kept up
/// to date by [`LeaseOwnership::run_maintenance`]. Implements
/// [`PartitionGate`] so a [`LogSource`](crate::source::LogSource) can pause
/// a partition's reader the moment its lease is lost.
pub struct LeaseOwnership {
    manager: Arc<dyn LeaseManager>,
    owned: DashMap<u32, bool>,
}

impl LeaseOwnership {
    pub fn new(manager: Arc<dyn LeaseManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            owned: DashMap::new(),
        })
    }

    /// Runs until `running` clears, acquiring/renewing a lease for every
    /// partition in `partitions` once per `renew_interval`. On exit, releases
    /// every lease still held rather than leaving it to expire via TTL,
    /// matching the drain sequence in §5 ("stop reading ... release leases").
    pub async fn run_maintenance(self: Arc<Self>, partitions: Vec<u32>, renew_interval: Duration, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            for &partition in &partitions {
                let held = self.owned.get(&partition).map(|v| *v).unwrap_or(false);
                let result = if held {
                    self.manager.renew(partition).await
                } else {
                    self.manager.acquire(partition).await
                };
                match result {
                    Ok(true) => {
                        if !held {
                            tracing::info!(partition, "acquired partition lease");
                        }
                        self.owned.insert(partition, true);
                    }
                    Ok(false) => {
                        if held {
                            tracing::warn!(partition, "lost partition lease");
                        }
                        self.owned.insert(partition, false);
                    }
                    Err(e) => {
                        tracing::error!(partition, error = %e, "lease renewal error, treating partition as unowned");
                        self.owned.insert(partition, false);
                    }
                }
            }
            tokio::time::sleep(renew_interval).await;
        }
        self.release_all(&partitions).await;
    }

    /// Releases every partition in `partitions` this node currently believes
    /// it owns. Called at the end of [`Self::run_maintenance`]'s drain, and
    /// available directly for a caller driving its own shutdown sequence.
    pub async fn release_all(&self, partitions: &[u32]) {
        for &partition in partitions {
            if self.owned.get(&partition).map(|v| *v).unwrap_or(false) {
                match self.manager.release(partition).await {
                    Ok(()) => tracing::info!(partition, "released partition lease on shutdown"),
                    Err(e) => tracing::error!(partition, error = %e, "failed to release partition lease on shutdown"),
                }
                self.owned.insert(partition, false);
            }
        }
    }
}

impl PartitionGate for LeaseOwnership {
    fn is_active(&self, partition: u32) -> bool {
        self.owned.get(&partition).map(|v| *v).unwrap_or(false)
    }
}

/// Dedup-and-quarantine stage: the `Emitter` a [`LogSource`] is constructed
/// with when exactly-once-effect delivery is required.
pub struct PartitionedExecutor {
    dedup: Arc<dyn DedupStore>,
    dedup_ttl: Duration,
    downstream: Arc<dyn Emitter>,
    dead_letter: Option<Arc<dyn Emitter>>,
    max_redeliveries: u32,
    redelivery_counts: DashMap<Uuid, u32>,
}

impl PartitionedExecutor {
    pub fn new(dedup: Arc<dyn DedupStore>, dedup_ttl: Duration, downstream: Arc<dyn Emitter>, max_redeliveries: u32) -> Self {
        Self {
            dedup,
            dedup_ttl,
            downstream,
            dead_letter: None,
            max_redeliveries,
            redelivery_counts: DashMap::new(),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn Emitter>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }
}

#[async_trait]
impl Emitter for PartitionedExecutor {
    async fn emit(&self, record: Record) -> Result<()> {
        if self.dedup.has_processed(record.id).await? {
            tracing::debug!(id = %record.id, "duplicate id, skipping downstream delivery");
            return Ok(());
        }

        match self.downstream.emit(record.clone()).await {
            Ok(()) => {
                self.dedup.mark_processed(record.id, self.dedup_ttl).await?;
                self.redelivery_counts.remove(&record.id);
                Ok(())
            }
            Err(e) => {
                let attempts = {
                    let mut entry = self.redelivery_counts.entry(record.id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempts > self.max_redeliveries {
                    tracing::warn!(id = %record.id, attempts, "redelivery limit exceeded, quarantining record");
                    if let Some(dead_letter) = &self.dead_letter {
                        dead_letter.emit(record.clone()).await?;
                    }
                    self.dedup.mark_processed(record.id, self.dedup_ttl).await?;
                    self.redelivery_counts.remove(&record.id);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}
