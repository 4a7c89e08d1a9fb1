//! SQLite storage engine.
//!
//! Single source of truth for event and subscription state. WAL mode keeps
//! reads concurrent with writes on file-backed databases; a busy timeout
//! absorbs transient lock contention. One connection, synchronized
//! internally behind a mutex.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{BusError, Result};
use crate::events::{Event, EventId, EventStatus};
use crate::handlers::{SubscriptionId, SubscriptionRecord};
use crate::storage::EventStore;

/// Storage backend. Owns the SQLite connection.
///
/// `close()` takes the connection out; every later write is a silent no-op
/// and every later read reports not-found/empty, so handlers abandoned by a
/// shutdown drain can finish without surfacing storage errors.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Opens or creates a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Creates an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL applies on file-backed databases; in-memory ignores it.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id          TEXT PRIMARY KEY,
                type        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT,
                metadata    TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                dlq_at      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);

            CREATE TABLE IF NOT EXISTS subscriptions (
                id          TEXT PRIMARY KEY,
                event_type  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn guard(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventStore for SqliteStore {
    fn insert_event(&self, event: &Event) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };

        conn.execute(
            "INSERT INTO events (
                id, type, payload, status, retry_count, last_error,
                metadata, created_at, updated_at, dlq_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id.0.to_string(),
                event.event_type,
                event.payload.to_string(),
                event.status.to_string(),
                event.retry_count,
                errors_to_json(event.last_error.as_deref()),
                event
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
                ts(event.created_at),
                ts(event.updated_at),
                event.dlq_at.map(ts),
            ],
        )?;
        Ok(())
    }

    fn get_event(&self, id: EventId) -> Result<Event> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Err(BusError::NotFound(id));
        };
        get_event_on(conn, id)
    }

    fn update_status(&self, id: EventId, status: EventStatus) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };

        let old = get_status_on(conn, id)?;
        if !old.can_transition_to(status) {
            return Err(BusError::InvalidTransition { from: old, to: status });
        }

        conn.execute(
            "UPDATE events SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), ts(Utc::now()), id.0.to_string()],
        )?;
        Ok(())
    }

    fn update_retry(&self, id: EventId, retry_count: u32, errors: &[String]) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };

        conn.execute(
            "UPDATE events SET retry_count = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                retry_count,
                errors_to_json(Some(errors)),
                ts(Utc::now()),
                id.0.to_string()
            ],
        )?;
        Ok(())
    }

    fn move_to_dlq(&self, id: EventId, errors: &[String]) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };

        let old = get_status_on(conn, id)?;
        if !old.can_transition_to(EventStatus::Dlq) {
            return Err(BusError::InvalidTransition {
                from: old,
                to: EventStatus::Dlq,
            });
        }

        let now = ts(Utc::now());
        conn.execute(
            "UPDATE events SET status = 'dlq', dlq_at = ?1, last_error = ?2, updated_at = ?1
             WHERE id = ?3",
            params![now, errors_to_json(Some(errors)), id.0.to_string()],
        )?;
        Ok(())
    }

    fn events_by_status(&self, status: EventStatus) -> Result<Vec<Event>> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, type, payload, status, retry_count, last_error,
                    metadata, created_at, updated_at, dlq_at
             FROM events WHERE status = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![status.to_string()], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };

        conn.execute(
            "INSERT INTO subscriptions (id, event_type, created_at) VALUES (?1, ?2, ?3)",
            params![
                record.id.0.to_string(),
                record.event_type,
                ts(record.created_at)
            ],
        )?;
        Ok(())
    }

    fn delete_subscription(&self, id: SubscriptionId) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(());
        };

        conn.execute(
            "DELETE FROM subscriptions WHERE id = ?1",
            params![id.0.to_string()],
        )?;
        Ok(())
    }

    fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, event_type, created_at FROM subscriptions ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id_str: String = row.get(0)?;
                let created_str: String = row.get(2)?;
                Ok((id_str, row.get::<_, String>(1)?, created_str))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id_str, event_type, created_str) in rows {
            records.push(SubscriptionRecord {
                id: SubscriptionId(parse_uuid(&id_str)?),
                event_type,
                created_at: parse_ts(&created_str),
            });
        }
        Ok(records)
    }

    fn list_dlq(&self, offset: usize, limit: usize) -> Result<Vec<Event>> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, type, payload, status, retry_count, last_error,
                    metadata, created_at, updated_at, dlq_at
             FROM events WHERE status = 'dlq'
             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count_dlq(&self) -> Result<usize> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(0);
        };

        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM events WHERE status = 'dlq'", [], |r| {
                r.get(0)
            })?;
        Ok(count as usize)
    }

    fn reset_dlq_event(&self, id: EventId) -> Result<()> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Err(BusError::NotFound(id));
        };

        let status = get_status_on(conn, id)?;
        if status != EventStatus::Dlq {
            return Err(BusError::NotInDlq { id, status });
        }

        conn.execute(
            "UPDATE events
             SET status = 'pending', retry_count = 0, last_error = NULL,
                 dlq_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![ts(Utc::now()), id.0.to_string()],
        )?;
        Ok(())
    }

    fn purge_dlq(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let guard = self.guard();
        let Some(conn) = guard.as_ref() else {
            return Ok(0);
        };

        let deleted = conn.execute(
            "DELETE FROM events WHERE status = 'dlq' AND created_at <= ?1",
            params![ts(cutoff)],
        )?;
        Ok(deleted)
    }

    fn close(&self) {
        // Dropping the connection flushes and closes the database.
        let _ = self.guard().take();
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so lexicographic TEXT comparison orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    s.parse().map_err(|_| {
        BusError::Storage(rusqlite::Error::InvalidColumnType(
            0,
            "id".into(),
            rusqlite::types::Type::Text,
        ))
    })
}

fn errors_to_json(errors: Option<&[String]>) -> Option<String> {
    match errors {
        None | Some([]) => None,
        Some(errs) => serde_json::to_string(errs).ok(),
    }
}

fn get_status_on(conn: &Connection, id: EventId) -> Result<EventStatus> {
    let status_str: String = conn
        .query_row(
            "SELECT status FROM events WHERE id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(BusError::NotFound(id))?;

    parse_status(&status_str, id)
}

fn get_event_on(conn: &Connection, id: EventId) -> Result<Event> {
    conn.query_row(
        "SELECT id, type, payload, status, retry_count, last_error,
                metadata, created_at, updated_at, dlq_at
         FROM events WHERE id = ?1",
        params![id.0.to_string()],
        row_to_event,
    )
    .optional()?
    .ok_or(BusError::NotFound(id))
}

fn parse_status(s: &str, id: EventId) -> Result<EventStatus> {
    match s {
        "pending" => Ok(EventStatus::Pending),
        "processing" => Ok(EventStatus::Processing),
        "done" => Ok(EventStatus::Done),
        "dlq" => Ok(EventStatus::Dlq),
        _ => Err(BusError::NotFound(id)),
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> std::result::Result<Event, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let payload_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let errors_str: Option<String> = row.get(5)?;
    let metadata_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;
    let dlq_str: Option<String> = row.get(9)?;

    let id = id_str.parse().map_err(|e: uuid::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status = match status_str.as_str() {
        "pending" => EventStatus::Pending,
        "processing" => EventStatus::Processing,
        "done" => EventStatus::Done,
        "dlq" => EventStatus::Dlq,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown event status: {other}").into(),
            ))
        }
    };

    Ok(Event {
        id: EventId(id),
        event_type: row.get(1)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        metadata: metadata_str.and_then(|s| serde_json::from_str::<HashMap<_, _>>(&s).ok()),
        status,
        retry_count: row.get(4)?,
        last_error: errors_str.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok()),
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
        dlq_at: dlq_str.map(|s| parse_ts(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(status: EventStatus) -> Event {
        let mut ev = Event::new("order.created", serde_json::json!({"id": 42}), None);
        ev.status = status;
        ev
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut ev = Event::new("order.created", serde_json::json!({"id": 42}), None);
        ev.metadata = Some(HashMap::from([("source".to_string(), "api".to_string())]));

        store.insert_event(&ev).unwrap();
        let loaded = store.get_event(ev.id).unwrap();

        assert_eq!(loaded.id, ev.id);
        assert_eq!(loaded.event_type, "order.created");
        assert_eq!(loaded.payload, serde_json::json!({"id": 42}));
        assert_eq!(loaded.status, EventStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
        assert!(loaded.last_error.is_none());
        assert!(loaded.dlq_at.is_none());
        assert_eq!(
            loaded.metadata.unwrap().get("source").map(String::as_str),
            Some("api")
        );
    }

    #[test]
    fn get_unknown_event_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.get_event(EventId::new()).unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)));
    }

    #[test]
    fn status_transitions_are_validated() {
        let store = SqliteStore::in_memory().unwrap();
        let ev = seeded(EventStatus::Pending);
        store.insert_event(&ev).unwrap();

        store.update_status(ev.id, EventStatus::Processing).unwrap();
        store.update_status(ev.id, EventStatus::Done).unwrap();

        let err = store
            .update_status(ev.id, EventStatus::Processing)
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::InvalidTransition {
                from: EventStatus::Done,
                to: EventStatus::Processing
            }
        ));
    }

    #[test]
    fn retry_write_through_and_dlq_move() {
        let store = SqliteStore::in_memory().unwrap();
        let ev = seeded(EventStatus::Pending);
        store.insert_event(&ev).unwrap();
        store.update_status(ev.id, EventStatus::Processing).unwrap();

        let errors = vec!["boom-1".to_string(), "boom-2".to_string()];
        store.update_retry(ev.id, 2, &errors).unwrap();

        let loaded = store.get_event(ev.id).unwrap();
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some(errors.as_slice()));

        store.move_to_dlq(ev.id, &errors).unwrap();
        let dead = store.get_event(ev.id).unwrap();
        assert_eq!(dead.status, EventStatus::Dlq);
        assert!(dead.dlq_at.is_some());
    }

    #[test]
    fn reset_dlq_event_restores_pending_shape() {
        let store = SqliteStore::in_memory().unwrap();
        let ev = seeded(EventStatus::Pending);
        store.insert_event(&ev).unwrap();
        store.update_status(ev.id, EventStatus::Processing).unwrap();
        store.move_to_dlq(ev.id, &["boom".to_string()]).unwrap();

        store.reset_dlq_event(ev.id).unwrap();
        let reset = store.get_event(ev.id).unwrap();
        assert_eq!(reset.status, EventStatus::Pending);
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_error.is_none());
        assert!(reset.dlq_at.is_none());
    }

    #[test]
    fn reset_rejects_wrong_status_and_unknown_id() {
        let store = SqliteStore::in_memory().unwrap();
        let ev = seeded(EventStatus::Pending);
        store.insert_event(&ev).unwrap();

        let err = store.reset_dlq_event(ev.id).unwrap_err();
        assert!(matches!(err, BusError::NotInDlq { .. }));

        let err = store.reset_dlq_event(EventId::new()).unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)));
    }

    #[test]
    fn purge_follows_created_at_never_dlq_at() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        // Old event, freshly dead-lettered.
        let mut old = seeded(EventStatus::Dlq);
        old.created_at = now - chrono::Duration::days(10);
        old.dlq_at = Some(now);
        store.insert_event(&old).unwrap();

        // Fresh event, also dead.
        let mut fresh = seeded(EventStatus::Dlq);
        fresh.dlq_at = Some(now);
        store.insert_event(&fresh).unwrap();

        let deleted = store.purge_dlq(now - chrono::Duration::days(7)).unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get_event(old.id).is_err());
        assert!(store.get_event(fresh.id).is_ok());
        assert_eq!(store.count_dlq().unwrap(), 1);
    }

    #[test]
    fn dlq_listing_is_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        let mut ids = Vec::new();
        for age_days in [3i64, 1, 2] {
            let mut ev = seeded(EventStatus::Dlq);
            ev.created_at = now - chrono::Duration::days(age_days);
            ev.dlq_at = Some(now);
            store.insert_event(&ev).unwrap();
            ids.push((age_days, ev.id));
        }

        let page = store.list_dlq(0, 2).unwrap();
        assert_eq!(page.len(), 2);
        // Newest (1 day old) first, then 2 days old.
        assert_eq!(page[0].id, ids[1].1);
        assert_eq!(page[1].id, ids[2].1);

        let rest = store.list_dlq(2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0].1);
    }

    #[test]
    fn closed_store_tolerates_writes_and_reports_reads() {
        let store = SqliteStore::in_memory().unwrap();
        let ev = seeded(EventStatus::Pending);
        store.insert_event(&ev).unwrap();
        store.close();

        // Writes are silent no-ops.
        assert!(store.insert_event(&seeded(EventStatus::Pending)).is_ok());
        assert!(store.update_status(ev.id, EventStatus::Processing).is_ok());
        assert!(store.update_retry(ev.id, 1, &["x".to_string()]).is_ok());

        // Reads report not-found/empty.
        assert!(matches!(
            store.get_event(ev.id).unwrap_err(),
            BusError::NotFound(_)
        ));
        assert!(store.events_by_status(EventStatus::Pending).unwrap().is_empty());
        assert_eq!(store.count_dlq().unwrap(), 0);
    }

    #[test]
    fn subscription_rows_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let record = SubscriptionRecord {
            id: SubscriptionId::new(),
            event_type: "order.*".to_string(),
            created_at: Utc::now(),
        };

        store.insert_subscription(&record).unwrap();
        let listed = store.list_subscriptions().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
        assert_eq!(listed[0].event_type, "order.*");

        store.delete_subscription(record.id).unwrap();
        // Idempotent.
        store.delete_subscription(record.id).unwrap();
        assert!(store.list_subscriptions().unwrap().is_empty());
    }
}
