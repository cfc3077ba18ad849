//! A partitioned, replicated event log with a checkpointable dataflow
//! runtime on top: append-only segmented storage, per-partition consumers
//! with durable offsets and deduplication, leader-based replication across
//! a node cluster, and an operator graph with event-time watermarking.

pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod emitter;
pub mod error;
pub mod executor;
pub mod handler;
pub mod log;
pub mod operators;
pub mod record;
pub mod replicated_log;
pub mod source;
pub mod stores;
pub mod window;

pub use config::FluxConfig;
pub use error::{FluxError, Result};
pub use record::Record;

/// Initializes process-wide structured logging. Safe to call more than
/// once; later calls are a silent no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(true).with_level(true).try_init();
}
