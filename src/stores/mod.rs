//! External collaborator interfaces (§4.2-§4.4, components C2-C4).
//!
//! These are abstract stores: the engine is written against the traits
//! below, and production deployments back them with whatever linearizable
//! KV store they already operate (the spec explicitly treats Kafka/Valkey/
//! Redis/MQTT as out of scope). Each trait ships an in-memory reference
//! implementation for tests and single-process use, grounded on
//! `original_source/pspf/runtime/dedup.py` (dedup) and
//! `pspf/runtime/coordination.py` (leases, translated from Lua
//! compare-and-expire scripts to `dashmap`'s atomic entry API).

pub mod dedup;
pub mod lease;
pub mod offset;

pub use dedup::{DedupStore, InMemoryDedupStore};
pub use lease::{InMemoryLeaseManager, LeaseManager, LeaseTable};
pub use offset::{InMemoryOffsetStore, OffsetStore};
