//! SQLite-backed local store.
//!
//! Persists the mutation queue, the event log and the entity cache so that
//! unsynced work survives process restarts.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use tillsync_common::{
    EntityPayload, EntitySyncStatus, EntityType, Error, EventId, EventStatus, MutationStatus,
    Operation, QueueId, Result,
};

use crate::records::{
    CachedEntity, EventPatch, MutationPatch, MutationQueueItem, NewMutation, PosEvent, QueueStats,
};
use crate::store::LocalStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutation_status
    ON mutation_queue(status, id);

CREATE TABLE IF NOT EXISTS pos_events (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    transaction_id TEXT,
    created_at TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_status_created
    ON pos_events(status, created_at);

CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    id TEXT NOT NULL,
    server_id TEXT,
    data TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    sync_error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, id)
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const MUTATION_COLUMNS: &str =
    "id, operation, entity_type, payload, timestamp, attempts, status, last_error";
const EVENT_COLUMNS: &str =
    "event_id, event_type, payload, status, transaction_id, created_at, last_error";
const CACHE_COLUMNS: &str =
    "entity_type, id, server_id, data, sync_status, sync_error, updated_at";

/// Local store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// Items left `Syncing` by a previous process are returned to `Pending`.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        let journal: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(storage_err)?;
        debug!("SQLite journal mode: {}", journal);
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA synchronous=FULL;")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        let requeued = store.requeue_interrupted()?;
        if requeued > 0 {
            warn!("Requeued {} mutations interrupted mid-sync", requeued);
        }
        info!("Local store opened successfully");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("store connection lock poisoned".to_string()))
    }

    /// Rows in insertion order; the wall-clock timestamp may step backwards.
    fn query_mutations(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MutationQueueItem>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM mutation_queue {} ORDER BY id ASC",
            MUTATION_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(args, mutation_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn query_events(&self, status: EventStatus) -> Result<Vec<PosEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM pos_events WHERE status = ?1 ORDER BY rowid ASC",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map([status.as_str()], event_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }
}

impl LocalStore for SqliteStore {
    fn enqueue_mutation(&self, mutation: NewMutation) -> Result<QueueId> {
        let payload = serde_json::to_string(&mutation.entity.to_value()?)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO mutation_queue
            (operation, entity_type, entity_id, payload, timestamp, attempts, status)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            "#,
            params![
                mutation.operation.as_str(),
                mutation.entity.entity_type().collection(),
                mutation.entity.entity_id(),
                payload,
                ts(mutation.timestamp),
                MutationStatus::Pending.as_str(),
            ],
        )
        .map_err(storage_err)?;
        let id = QueueId(conn.last_insert_rowid());
        debug!(
            "Enqueued {} {} {} as #{}",
            mutation.operation,
            mutation.entity.entity_type(),
            mutation.entity.entity_id(),
            id
        );
        Ok(id)
    }

    fn pending_mutations(&self) -> Result<Vec<MutationQueueItem>> {
        self.query_mutations("WHERE status = ?1", &[&MutationStatus::Pending.as_str()])
    }

    fn mutations(&self) -> Result<Vec<MutationQueueItem>> {
        self.query_mutations("", &[])
    }

    fn mutation(&self, id: QueueId) -> Result<Option<MutationQueueItem>> {
        Ok(self
            .query_mutations("WHERE id = ?1", &[&id.get()])?
            .into_iter()
            .next())
    }

    fn update_mutation(&self, id: QueueId, patch: &MutationPatch) -> Result<()> {
        let (set_error, error) = match &patch.last_error {
            Some(error) => (true, error.clone()),
            None => (false, None),
        };
        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE mutation_queue SET
                    status = COALESCE(?2, status),
                    attempts = COALESCE(?3, attempts),
                    last_error = CASE WHEN ?4 THEN ?5 ELSE last_error END
                WHERE id = ?1
                "#,
                params![
                    id.get(),
                    patch.status.map(|s| s.as_str()),
                    patch.attempts,
                    set_error,
                    error,
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Queue item {}", id)));
        }
        Ok(())
    }

    fn replace_mutation_payload(
        &self,
        id: QueueId,
        operation: Operation,
        entity: &EntityPayload,
    ) -> Result<()> {
        let payload = serde_json::to_string(&entity.to_value()?)?;
        let changed = self
            .conn()?
            .execute(
                "UPDATE mutation_queue SET operation = ?2, payload = ?3 WHERE id = ?1",
                params![id.get(), operation.as_str(), payload],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Queue item {}", id)));
        }
        Ok(())
    }

    fn delete_mutation(&self, id: QueueId) -> Result<()> {
        debug!("Deleting queue item #{}", id);
        self.conn()?
            .execute("DELETE FROM mutation_queue WHERE id = ?1", params![id.get()])
            .map_err(storage_err)?;
        Ok(())
    }

    fn requeue_interrupted(&self) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE mutation_queue SET status = ?1 WHERE status = ?2",
                params![MutationStatus::Pending.as_str(), MutationStatus::Syncing.as_str()],
            )
            .map_err(storage_err)
    }

    fn append_event(&self, event: &PosEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        self.conn()?
            .execute(
                r#"
                INSERT INTO pos_events
                (event_id, event_type, payload, status, transaction_id, created_at, last_error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    event.event_id.as_str(),
                    event.event_type.as_str(),
                    payload,
                    event.status.as_str(),
                    event.transaction_id,
                    ts(event.created_at),
                    event.last_error,
                ],
            )
            .map_err(storage_err)?;
        debug!("Appended {} event {}", event.event_type, event.event_id);
        Ok(())
    }

    fn pending_events(&self) -> Result<Vec<PosEvent>> {
        self.query_events(EventStatus::Pending)
    }

    fn events_with_status(&self, status: EventStatus) -> Result<Vec<PosEvent>> {
        self.query_events(status)
    }

    fn event(&self, id: &EventId) -> Result<Option<PosEvent>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM pos_events WHERE event_id = ?1", EVENT_COLUMNS);
        conn.query_row(&sql, [id.as_str()], event_from_row)
            .optional()
            .map_err(storage_err)
    }

    fn update_event(&self, id: &EventId, patch: &EventPatch) -> Result<()> {
        let (set_error, error) = match &patch.last_error {
            Some(error) => (true, error.clone()),
            None => (false, None),
        };
        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE pos_events SET
                    status = COALESCE(?2, status),
                    transaction_id = COALESCE(?3, transaction_id),
                    last_error = CASE WHEN ?4 THEN ?5 ELSE last_error END
                WHERE event_id = ?1
                "#,
                params![
                    id.as_str(),
                    patch.status.map(|s| s.as_str()),
                    patch.transaction_id,
                    set_error,
                    error,
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Event {}", id)));
        }
        Ok(())
    }

    fn purge_events(&self, status: EventStatus, older_than: DateTime<Utc>) -> Result<usize> {
        self.conn()?
            .execute(
                "DELETE FROM pos_events WHERE status = ?1 AND created_at < ?2",
                params![status.as_str(), ts(older_than)],
            )
            .map_err(storage_err)
    }

    fn replace_cached_entities(
        &self,
        entity_type: EntityType,
        entities: &[CachedEntity],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "DELETE FROM entity_cache WHERE entity_type = ?1",
            [entity_type.collection()],
        )
        .map_err(storage_err)?;
        for entity in entities {
            upsert_entity(&tx, entity)?;
        }
        tx.commit().map_err(storage_err)?;
        info!("Replaced {} cache with {} entries", entity_type, entities.len());
        Ok(())
    }

    fn cached_entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM entity_cache WHERE entity_type = ?1 ORDER BY id",
            CACHE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map([entity_type.collection()], cached_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn cached_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM entity_cache WHERE entity_type = ?1 AND id = ?2",
            CACHE_COLUMNS
        );
        conn.query_row(&sql, params![entity_type.collection(), id], cached_from_row)
            .optional()
            .map_err(storage_err)
    }

    fn upsert_cached_entity(&self, entity: &CachedEntity) -> Result<()> {
        let conn = self.conn()?;
        upsert_entity(&conn, entity)
    }

    fn remove_cached_entity(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM entity_cache WHERE entity_type = ?1 AND id = ?2",
                params![entity_type.collection(), id],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn set_entity_sync_state(
        &self,
        entity_type: EntityType,
        id: &str,
        status: EntitySyncStatus,
        server_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                UPDATE entity_cache SET
                    sync_status = ?3,
                    server_id = COALESCE(?4, server_id),
                    sync_error = ?5
                WHERE entity_type = ?1 AND id = ?2
                "#,
                params![entity_type.collection(), id, status.as_str(), server_id, error],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(storage_err)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn clear_setting(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM settings WHERE key = ?1", [key])
            .map_err(storage_err)?;
        Ok(())
    }

    fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stats = QueueStats::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;
        for row in rows {
            let (status, count) = row.map_err(storage_err)?;
            let count = count as usize;
            match status.parse::<MutationStatus>()? {
                MutationStatus::Pending => stats.mutations_pending = count,
                MutationStatus::Syncing => stats.mutations_syncing = count,
                MutationStatus::Failed => stats.mutations_failed = count,
            }
        }

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM pos_events GROUP BY status")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;
        for row in rows {
            let (status, count) = row.map_err(storage_err)?;
            let count = count as usize;
            match status.parse::<EventStatus>()? {
                EventStatus::Pending => stats.events_pending = count,
                EventStatus::Synced => stats.events_synced = count,
                EventStatus::Failed => stats.events_failed = count,
                EventStatus::Voided => stats.events_voided = count,
            }
        }

        Ok(stats)
    }
}

fn upsert_entity(conn: &Connection, entity: &CachedEntity) -> Result<()> {
    let data = serde_json::to_string(&entity.data)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO entity_cache
        (entity_type, id, server_id, data, sync_status, sync_error, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            entity.entity_type.collection(),
            entity.id,
            entity.server_id,
            data,
            entity.sync_status.as_str(),
            entity.sync_error,
            ts(entity.updated_at),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_err(idx, e))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_err(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<MutationQueueItem> {
    let entity_type: EntityType = text_col(row, 2)?;
    let entity = EntityPayload::from_value(entity_type, json_col(row, 3)?)
        .map_err(|e| conversion_err(3, e))?;
    Ok(MutationQueueItem {
        id: QueueId(row.get(0)?),
        operation: text_col(row, 1)?,
        entity,
        timestamp: time_col(row, 4)?,
        attempts: row.get(5)?,
        status: text_col(row, 6)?,
        last_error: row.get(7)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<PosEvent> {
    let id: String = row.get(0)?;
    Ok(PosEvent {
        event_id: EventId::new(id).map_err(|e| conversion_err(0, e))?,
        event_type: text_col(row, 1)?,
        payload: json_col(row, 2)?,
        status: text_col(row, 3)?,
        transaction_id: row.get(4)?,
        created_at: time_col(row, 5)?,
        last_error: row.get(6)?,
    })
}

fn cached_from_row(row: &Row<'_>) -> rusqlite::Result<CachedEntity> {
    Ok(CachedEntity {
        entity_type: text_col(row, 0)?,
        id: row.get(1)?,
        server_id: row.get(2)?,
        data: json_col(row, 3)?,
        sync_status: text_col(row, 4)?,
        sync_error: row.get(5)?,
        updated_at: time_col(row, 6)?,
    })
}
