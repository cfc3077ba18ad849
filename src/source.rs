//! Per-partition log consumer (§4.5, component C5).
//!
//! Grounded on `original_source/pspf/connectors/log_source.py`
//! (`LogSource._consume_partition`): restore the committed offset, read
//! forward, emit, commit after each record. The original commits on every
//! message rather than batching, on the stated reasoning "correctness >
//! perfection"; this keeps that tradeoff.
//!
//! Unlike the original, a lost partition lease is represented by a
//! [`PartitionGate`] the caller supplies rather than a flag this type would
//! have to know about. When the gate reports a partition inactive, its
//! consumer loop idles without reading or committing until the gate reports
//! it active again -- "pause that partition's reader; resume when
//! re-acquired" (§4.6), never "drop work and keep committing".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::emitter::Emitter;
use crate::log::PartitionedLog;
use crate::stores::OffsetStore;

/// Governs whether a partition's consumer loop is allowed to read right now.
pub trait PartitionGate: Send + Sync {
    fn is_active(&self, partition: u32) -> bool;
}

/// The gate used when nothing arbitrates partition ownership (single
/// process, no lease manager configured).
pub struct AlwaysActive;

impl PartitionGate for AlwaysActive {
    fn is_active(&self, _partition: u32) -> bool {
        true
    }
}

/// Reads committed records for one consumer group and hands them to an
/// [`Emitter`], advancing the group's durable offset as records are
/// acknowledged.
pub struct LogSource {
    log: Arc<PartitionedLog>,
    consumer_group: String,
    offset_store: Arc<dyn OffsetStore>,
    poll_interval: Duration,
}

impl LogSource {
    pub fn new(
        log: Arc<PartitionedLog>,
        consumer_group: impl Into<String>,
        offset_store: Arc<dyn OffsetStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            log,
            consumer_group: consumer_group.into(),
            offset_store,
            poll_interval,
        }
    }

    /// Spawns one task per partition in `partitions`. Each task runs until
    /// `running` is cleared. Returns the join handles so callers can await a
    /// clean shutdown.
    pub fn spawn(
        self: Arc<Self>,
        partitions: impl IntoIterator<Item = u32>,
        emitter: Arc<dyn Emitter>,
        gate: Arc<dyn PartitionGate>,
        running: Arc<AtomicBool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        partitions
            .into_iter()
            .map(|partition| {
                let this = self.clone();
                let emitter = emitter.clone();
                let gate = gate.clone();
                let running = running.clone();
                tokio::spawn(async move { this.consume_partition(partition, emitter, gate, running).await })
            })
            .collect()
    }

    async fn consume_partition(
        &self,
        partition: u32,
        emitter: Arc<dyn Emitter>,
        gate: Arc<dyn PartitionGate>,
        running: Arc<AtomicBool>,
    ) {
        let mut offset = match self.offset_store.get(&self.consumer_group, partition).await {
            Ok(Some(o)) => o,
            Ok(None) => 0,
            Err(e) => {
                tracing::error!(partition, error = %e, "failed to restore offset, consumer not starting");
                return;
            }
        };
        tracing::info!(partition, offset, group = %self.consumer_group, "starting partition consumer");

        while running.load(Ordering::Relaxed) {
            if !gate.is_active(partition) {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let log = self.log.clone();
            let from_offset = offset;
            let records = match tokio::task::spawn_blocking(move || log.read(partition, from_offset)).await {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    tracing::error!(partition, error = %e, "log read failed");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(join_err) => {
                    tracing::error!(partition, error = %join_err, "log read task panicked");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if records.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            for record in records {
                if !gate.is_active(partition) {
                    tracing::info!(partition, "lease lost mid-batch, pausing without advancing offset");
                    break;
                }
                let next_offset = record.offset + 1;
                let record_offset = record.offset;
                match emitter.emit(record).await {
                    Ok(()) => match self.offset_store.commit(&self.consumer_group, partition, next_offset).await {
                        Ok(()) => offset = next_offset,
                        Err(e) => {
                            tracing::error!(partition, next_offset, error = %e, "offset commit failed");
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(partition, offset = record_offset, error = %e, "emit failed, record will be redelivered");
                        break;
                    }
                }
            }
        }
        tracing::info!(partition, group = %self.consumer_group, "partition consumer stopped");
    }
}
