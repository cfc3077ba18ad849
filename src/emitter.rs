//! The seam between a log reader and whatever consumes its records.
//!
//! The original implementation wires dedup in by reassigning the source's
//! `emit` attribute at startup (`original_emit = self.source.emit; ...
//! self.source.emit = dedup_emit`). That makes the call graph depend on
//! mutable state nobody can see from the type signature. Here the chain is
//! built once, at construction, as ordinary composition: a [`LogSource`]
//! is handed an `Arc<dyn Emitter>` and never learns whether it is talking
//! to a dedup stage, an operator pipeline, or a test double.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::error::{FluxError, Result};
use crate::record::Record;

#[async_trait]
pub trait Emitter: Send + Sync {
    /// Delivers `record` downstream. An `Err` means the record was not
    /// durably handled: the caller must not advance past it.
    async fn emit(&self, record: Record) -> Result<()>;
}

/// An emitter that forwards to a plain async closure, for wiring tests and
/// small pipelines without a dedicated type.
pub struct FnEmitter<F>(pub F);

#[async_trait]
impl<F, Fut> Emitter for FnEmitter<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn emit(&self, record: Record) -> Result<()> {
        (self.0)(record).await
    }
}

/// Bridges a [`LogSource`](crate::source::LogSource) (or a
/// [`crate::executor::PartitionedExecutor`] sitting in front of it) into an
/// operator graph's first inbox: each record is sent as an element, and its
/// timestamp is advanced as a watermark, matching the `Source` role in
/// §4.9 ("extracts event time via a timestamp_extractor and emits
/// watermarks").
pub struct PipelineEmitter {
    inlet: crate::operators::StageInlet<Record>,
    high_watermark: AtomicI64,
}

impl PipelineEmitter {
    pub fn new(inlet: crate::operators::StageInlet<Record>) -> Self {
        Self {
            inlet,
            high_watermark: AtomicI64::new(i64::MIN),
        }
    }
}

#[async_trait]
impl Emitter for PipelineEmitter {
    async fn emit(&self, record: Record) -> Result<()> {
        // Watermarks must never regress (spec Property 7): out-of-order
        // arrivals still only advance the watermark to the highest event
        // time seen so far, never back to a late record's own timestamp.
        let watermark = self.high_watermark.fetch_max(record.timestamp, Ordering::SeqCst).max(record.timestamp);
        self.inlet
            .elements
            .send(record)
            .await
            .map_err(|_| FluxError::Cancelled)?;
        let _ = self.inlet.watermarks.send(watermark);
        Ok(())
    }
}
