//! Conflict detection and resolution.
//!
//! A 409 on a queued mutation only becomes an operator-facing conflict when
//! the local and server versions actually differ in a compared field, and no
//! stored preference can settle it automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use tillsync_common::{EntityType, Error, QueueId, Result};
use tillsync_store::MutationQueueItem;

/// Setting key holding the automatic resolution preference.
pub const PREFERENCE_KEY: &str = "conflict.auto_resolve";

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Push the local version over the server's.
    KeepLocal,
    /// Overwrite the local copy with the server's version.
    KeepServer,
    /// Push an operator-edited payload.
    Merge,
    /// Whichever side was modified last wins; ties favor local.
    LastWriteWins,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::KeepLocal => "KEEP_LOCAL",
            ConflictStrategy::KeepServer => "KEEP_SERVER",
            ConflictStrategy::Merge => "MERGE",
            ConflictStrategy::LastWriteWins => "LAST_WRITE_WINS",
        }
    }

    /// Whether the strategy may be stored as the automatic preference.
    /// Everything else is an operator's call.
    pub fn is_automatic(&self) -> bool {
        matches!(self, ConflictStrategy::LastWriteWins)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    /// Accepts `KEEP_LOCAL`, `keep-local` and similar spellings.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "KEEP_LOCAL" => Ok(ConflictStrategy::KeepLocal),
            "KEEP_SERVER" => Ok(ConflictStrategy::KeepServer),
            "MERGE" => Ok(ConflictStrategy::Merge),
            "LAST_WRITE_WINS" => Ok(ConflictStrategy::LastWriteWins),
            _ => Err(Error::InvalidInput(format!("Unknown conflict strategy: {}", s))),
        }
    }
}

/// An operator's (or a preference's) decision for a pending conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    /// Required for `Merge`: the fields to push, overlaid on the local
    /// snapshot.
    #[serde(default)]
    pub merged_payload: Option<Value>,
    /// The server reported the entity as gone.
    #[serde(default)]
    pub server_deleted: bool,
}

impl ConflictResolution {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            merged_payload: None,
            server_deleted: false,
        }
    }

    pub fn merge(payload: Value) -> Self {
        Self {
            strategy: ConflictStrategy::Merge,
            merged_payload: Some(payload),
            server_deleted: false,
        }
    }

    /// # Errors
    /// - `InvalidInput` for a merge without a JSON object payload
    pub fn validate(&self) -> Result<()> {
        if self.strategy == ConflictStrategy::Merge {
            match &self.merged_payload {
                Some(Value::Object(_)) => {}
                Some(_) => {
                    return Err(Error::InvalidInput(
                        "Merged payload must be a JSON object".to_string(),
                    ))
                }
                None => {
                    return Err(Error::InvalidInput(
                        "Merge resolution requires a merged payload".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Everything the operator needs to decide a conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictInfo {
    pub queue_id: QueueId,
    pub item: MutationQueueItem,
    pub local_data: Value,
    /// `None` when the server no longer has the entity.
    pub server_data: Option<Value>,
    pub server_deleted: bool,
    pub detected_at: DateTime<Utc>,
}

/// Whether every compared field is equal on both sides.
///
/// Numbers are compared by value, so `3` and `3.0` match. A field absent on
/// one side matches `null` on the other.
pub fn fields_match(entity_type: EntityType, local: &Value, server: &Value) -> bool {
    entity_type.compared_fields().iter().all(|field| {
        let a = local.get(*field).unwrap_or(&Value::Null);
        let b = server.get(*field).unwrap_or(&Value::Null);
        values_equal(a, b)
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Last-modified time reported by the server, if any.
pub fn server_modified(server: &Value) -> Option<DateTime<Utc>> {
    server
        .get("updated_at")
        .or_else(|| server.get("updatedAt"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Pick the side that wrote last. Ties and unknown server times favor local.
pub fn last_write_winner(local_modified: DateTime<Utc>, server: &Value) -> ConflictStrategy {
    match server_modified(server) {
        Some(server_modified) if server_modified > local_modified => ConflictStrategy::KeepServer,
        _ => ConflictStrategy::KeepLocal,
    }
}

/// Idempotency key for re-creating an entity the server deleted.
///
/// Distinct from the original create key, stable across retries of the same
/// queue item.
pub fn recreate_key(client_id: &str, queue_id: QueueId) -> String {
    format!("{}:recreate:{}", client_id, queue_id)
}

/// Server id from a response body (`id` as string or number).
pub fn response_server_id(body: &Value) -> Option<String> {
    match body.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "keep-local".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::KeepLocal
        );
        assert_eq!(
            "LAST_WRITE_WINS".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::LastWriteWins
        );
        assert!("newest".parse::<ConflictStrategy>().is_err());
        assert_eq!(
            ConflictStrategy::KeepServer.as_str().parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::KeepServer
        );
    }

    #[test]
    fn test_merge_requires_payload() {
        assert!(ConflictResolution::new(ConflictStrategy::Merge).validate().is_err());
        assert!(ConflictResolution::merge(json!(5)).validate().is_err());
        assert!(ConflictResolution::merge(json!({"quantity": 4})).validate().is_ok());
        assert!(ConflictResolution::new(ConflictStrategy::KeepLocal).validate().is_ok());
    }

    #[test]
    fn test_only_last_write_wins_is_automatic() {
        assert!(ConflictStrategy::LastWriteWins.is_automatic());
        assert!(!ConflictStrategy::KeepLocal.is_automatic());
        assert!(!ConflictStrategy::KeepServer.is_automatic());
        assert!(!ConflictStrategy::Merge.is_automatic());
    }

    #[test]
    fn test_fields_match_ignores_other_fields() {
        let local = json!({"id": "p-1", "name": "Tea", "sku": "T1", "price": 3, "quantity": 2,
                           "updated_at": "2026-01-01T00:00:00Z"});
        let server = json!({"id": "srv-1", "name": "Tea", "sku": "T1", "price": 3.0, "quantity": 2,
                            "category": null, "updatedAt": "2026-02-01T00:00:00Z"});
        assert!(fields_match(EntityType::Products, &local, &server));

        let changed = json!({"name": "Tea", "sku": "T1", "price": 3.0, "quantity": 7});
        assert!(!fields_match(EntityType::Products, &local, &changed));
    }

    #[test]
    fn test_last_write_winner() {
        let local = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let newer = json!({"updatedAt": "2026-03-01T12:00:01Z"});
        assert_eq!(last_write_winner(local, &newer), ConflictStrategy::KeepServer);

        let same = json!({"updated_at": "2026-03-01T12:00:00Z"});
        assert_eq!(last_write_winner(local, &same), ConflictStrategy::KeepLocal);

        let unknown = json!({"name": "Tea"});
        assert_eq!(last_write_winner(local, &unknown), ConflictStrategy::KeepLocal);
    }

    #[test]
    fn test_keys_and_ids() {
        assert_eq!(recreate_key("p-1", QueueId(7)), "p-1:recreate:7");
        assert_eq!(response_server_id(&json!({"id": "srv-1"})).as_deref(), Some("srv-1"));
        assert_eq!(response_server_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert!(response_server_id(&json!(null)).is_none());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn identical_products_always_match(
                name in "[A-Za-z ]{1,16}",
                price in 0u32..100_000,
                quantity in 0i64..10_000,
            ) {
                let value = json!({"name": name, "sku": null, "category": "x",
                                   "price": price, "quantity": quantity});
                prop_assert!(fields_match(EntityType::Products, &value, &value.clone()));
            }

            #[test]
            fn quantity_change_is_a_conflict(
                quantity in 0i64..10_000,
                delta in 1i64..100,
            ) {
                let local = json!({"name": "Tea", "price": 1.5, "quantity": quantity});
                let server = json!({"name": "Tea", "price": 1.5, "quantity": quantity + delta});
                prop_assert!(!fields_match(EntityType::Products, &local, &server));
            }
        }
    }
}
