//! Durable local store for tillsync.
//!
//! Holds the mutation queue, the append-only event log, the read-through
//! entity cache and operator settings. Everything written here survives a
//! crash; nothing here knows about the network.

pub mod records;
pub mod sqlite;
pub mod store;

pub use records::{
    CachedEntity, EventPatch, MutationPatch, MutationQueueItem, NewMutation, PosEvent, QueueStats,
};
pub use sqlite::SqliteStore;
pub use store::LocalStore;
