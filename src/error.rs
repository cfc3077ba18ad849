//! Error kinds for the event-delivery engine.
//!
//! One variant per kind named in the error-handling design: callers match on
//! the enum, never on a formatted message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FluxError {
    /// A frame failed CRC verification outside the tail-recovery path, or a
    /// segment sequence has a gap. Non-recoverable for the affected partition.
    #[error("log corruption in partition {partition} at offset {offset}: {reason}")]
    LogCorruption {
        partition: u32,
        offset: u64,
        reason: String,
    },

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not leader for partition {0}")]
    NotLeader(u32),

    #[error("lease lost for partition {0}")]
    LeaseLost(u32),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("replication to {peer} failed: {reason}")]
    ReplicationFailure { peer: String, reason: String },

    #[error("handler error: {0}")]
    Handler(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<rmp_serde::encode::Error> for FluxError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FluxError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FluxError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FluxError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FluxError>;
