//! Cache layers for upstream payloads
//!
//! An in-memory entry table answers fresh requests. A durable snapshot store
//! keeps the last good payload per key on disk. The orchestrator ties both to
//! the upstream client and decides what to serve when upstream fails.

mod freshness;
mod orchestrator;
mod snapshot;
mod table;

pub use freshness::{is_fresh, NEVER_FETCHED};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Resolved, Source};
pub use snapshot::{SnapshotRecord, SnapshotStore, DEFAULT_STORE_TIMEOUT};
pub use table::{CacheEntry, EntryTable};
