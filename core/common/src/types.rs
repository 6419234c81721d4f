//! Common types used throughout tillsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Locally assigned, monotonically increasing queue identifier.
///
/// Insertion order is processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueId(pub i64);

impl QueueId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated idempotency key of a business event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh random event id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("EventId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Implements `as_str`, `Display` and `FromStr` for a unit-only enum stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable text form used in storage and on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        concat!("Unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Kind of change carried by a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

text_enum!(Operation {
    Create => "CREATE",
    Update => "UPDATE",
    Delete => "DELETE",
});

/// Processing status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    /// Waiting to be sent.
    Pending,
    /// A send attempt is in flight. Still unresolved work.
    Syncing,
    /// Attempts exhausted; needs operator action.
    Failed,
}

text_enum!(MutationStatus {
    Pending => "PENDING",
    Syncing => "SYNCING",
    Failed => "FAILED",
});

/// Status of an append-only business event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Synced,
    /// Rejected by the server. Never retried automatically.
    Failed,
    /// A failed event an operator has explicitly written off.
    Voided,
}

text_enum!(EventStatus {
    Pending => "PENDING",
    Synced => "SYNCED",
    Failed => "FAILED",
    Voided => "VOIDED",
});

/// Kind of business event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Sale,
}

text_enum!(EventType {
    Sale => "SALE",
});

/// Sync state of a cached entity, shown next to it in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySyncStatus {
    /// Local change not yet confirmed by the server.
    Pending,
    Synced,
    /// The server rejected the last change; see the entity's error message.
    Error,
}

text_enum!(EntitySyncStatus {
    Pending => "pending",
    Synced => "synced",
    Error => "error",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_generation() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_event_id_empty_fails() {
        assert!(EventId::new("  ").is_err());
    }

    #[test]
    fn test_status_text_forms() {
        assert_eq!(MutationStatus::Syncing.as_str(), "SYNCING");
        assert_eq!("FAILED".parse::<MutationStatus>().unwrap(), MutationStatus::Failed);
        assert_eq!("VOIDED".parse::<EventStatus>().unwrap(), EventStatus::Voided);
        assert!("DONE".parse::<EventStatus>().is_err());
        assert_eq!(Operation::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_serde_matches_text_form() {
        let json = serde_json::to_string(&Operation::Create).unwrap();
        assert_eq!(json, "\"CREATE\"");
        let json = serde_json::to_string(&EntitySyncStatus::Synced).unwrap();
        assert_eq!(json, "\"synced\"");
    }
}
