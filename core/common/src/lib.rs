//! Common utilities and types shared across tillsync modules.
//!
//! This module provides the error taxonomy, identifiers, entity schemas and
//! environment seams used by the store, the network client and the sync
//! engine.

pub mod entity;
pub mod env;
pub mod error;
pub mod types;

pub use entity::{EntityPayload, EntityType, Product, Sale, SaleLine};
pub use env::{Clock, Connectivity, ConnectivityFlag, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{
    EntitySyncStatus, EventId, EventStatus, EventType, MutationStatus, Operation, QueueId,
};
