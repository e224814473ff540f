use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;
use trellis_core::session::{Session, SessionBackend, SessionError, SessionId};

pub const SESSION_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Backend(err.to_string())
    }
}

/// Session backend on a single SQLite file; sessions survive restarts.
pub struct SqliteSessionBackend {
    conn: Mutex<Connection>,
}

impl SqliteSessionBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.migrate()?;
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.migrate()?;
        Ok(backend)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SESSION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SESSION_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn();
            conn.execute_batch(include_str!("../migrations/0001_sessions.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            debug!(event = "session_store_migrated", version = 1);
        }

        if current < 2 {
            let conn = self.conn();
            conn.execute_batch(include_str!("../migrations/0002_tree_version.sql"))?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
            debug!(event = "session_store_migrated", version = 2);
        }

        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<Session>, StorageError> {
        let row = self
            .conn()
            .query_row(
                "
                SELECT id, values_json, created_at, last_seen_at, expires_at, tree_version
                FROM sessions
                WHERE id = ?1
                ",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, values_json, created_at, last_seen_at, expires_at, tree_version)) = row else {
            return Ok(None);
        };
        let values: BTreeMap<String, serde_json::Value> = serde_json::from_str(&values_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let created_at = parse_timestamp(created_at)?;
        let mut session = Session::with_id(id, created_at, chrono::Duration::zero());
        session.values = values;
        session.last_seen_at = parse_timestamp(last_seen_at)?;
        session.expires_at = parse_timestamp(expires_at)?;
        session.tree_version = u64::try_from(tree_version).unwrap_or_default();
        Ok(Some(session))
    }

    pub fn store(&self, session: &Session) -> Result<(), StorageError> {
        let values_json = serde_json::to_string(&session.values)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn().execute(
            "
            INSERT INTO sessions (id, values_json, created_at, last_seen_at, expires_at, tree_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                values_json=excluded.values_json,
                last_seen_at=excluded.last_seen_at,
                expires_at=excluded.expires_at,
                tree_version=MAX(tree_version, excluded.tree_version)
            ",
            params![
                session.id,
                values_json,
                session.created_at.to_rfc3339(),
                session.last_seen_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
                i64::try_from(session.tree_version).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn session_ids(&self) -> Result<Vec<SessionId>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM sessions ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl SessionBackend for SqliteSessionBackend {
    fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.load(id)?)
    }

    fn put(&self, session: &Session) -> Result<(), SessionError> {
        Ok(self.store(session)?)
    }

    fn delete(&self, id: &str) -> Result<bool, SessionError> {
        Ok(self.remove(id)?)
    }

    fn ids(&self) -> Result<Vec<SessionId>, SessionError> {
        Ok(self.session_ids()?)
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use trellis_core::cell::{CellStore, Scope};
    use trellis_core::session::SessionManager;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(offset_secs)
    }

    #[test]
    fn fresh_database_is_migrated() {
        let backend = SqliteSessionBackend::open_in_memory().expect("open");
        assert_eq!(backend.schema_version().expect("version"), SESSION_SCHEMA_VERSION);
        backend.migrate().expect("second migrate is a no-op");
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        let err = SqliteSessionBackend::open(file.path())
            .err()
            .expect("open should fail");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion {
                found: 9,
                supported: 2
            }
        ));
    }

    #[test]
    fn version_one_database_gains_tree_version() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute_batch(include_str!("../migrations/0001_sessions.sql"))
                .expect("v1 schema");
            conn.execute("PRAGMA user_version = 1", []).expect("mark v1");
            conn.execute(
                "INSERT INTO sessions (id, values_json, created_at, last_seen_at, expires_at)
                 VALUES ('old', '{}', ?1, ?1, ?2)",
                params![ts(0).to_rfc3339(), ts(60).to_rfc3339()],
            )
            .expect("seed");
        }

        let backend = SqliteSessionBackend::open(file.path()).expect("migrate");
        assert_eq!(backend.schema_version().expect("version"), 2);
        let mut session = backend.load("old").expect("load").expect("present");
        assert_eq!(session.tree_version, 0);

        session.record_version(4);
        backend.store(&session).expect("store");
        session.tree_version = 2;
        backend.store(&session).expect("store older");
        let loaded = backend.load("old").expect("load").expect("present");
        assert_eq!(loaded.tree_version, 4);
    }

    #[test]
    fn session_cells_survive_reopen() {
        let file = NamedTempFile::new().expect("temp db");
        let store = CellStore::new();
        let counter = store
            .declare(Some("counter"), 0i64, Scope::Session)
            .expect("declare");

        let id = {
            let backend = Arc::new(SqliteSessionBackend::open(file.path()).expect("open"));
            let manager = SessionManager::new(backend, Duration::hours(1));
            let mut session = manager.resolve_at(None, ts(0)).session;
            store
                .set(&counter, Some(&mut session), 5)
                .expect("set counter");
            manager.persist(&session).expect("persist");
            session.id
        };

        let backend = Arc::new(SqliteSessionBackend::open(file.path()).expect("reopen"));
        let manager = SessionManager::new(backend, Duration::hours(1));
        let resolved = manager.resolve_at(Some(&id), ts(60));
        assert!(!resolved.fresh);
        assert_eq!(resolved.session.created_at, ts(0));
        assert_eq!(
            store.get(&counter, Some(&resolved.session)).expect("get"),
            5
        );
    }

    #[test]
    fn upsert_keeps_created_at_and_delete_reports_presence() {
        let backend = SqliteSessionBackend::open_in_memory().expect("open");
        let mut session = Session::with_id("s1", ts(0), Duration::seconds(30));
        session.values.insert("theme".to_string(), json!("dark"));
        backend.store(&session).expect("store");

        let mut moved = session.clone();
        moved.created_at = ts(100);
        moved.touch(ts(20), Duration::seconds(30));
        backend.store(&moved).expect("store again");

        let loaded = backend.load("s1").expect("load").expect("present");
        assert_eq!(loaded.created_at, ts(0));
        assert_eq!(loaded.expires_at, ts(50));
        assert_eq!(loaded.value("theme"), Some(&json!("dark")));

        assert_eq!(backend.session_ids().expect("ids"), vec!["s1".to_string()]);
        assert!(backend.remove("s1").expect("remove"));
        assert!(!backend.remove("s1").expect("remove twice"));
        assert!(backend.load("s1").expect("load").is_none());
    }

    #[test]
    fn manager_sweep_runs_against_sqlite() {
        let backend = Arc::new(SqliteSessionBackend::open_in_memory().expect("open"));
        let manager = SessionManager::new(backend.clone(), Duration::seconds(10));
        let stale = manager.resolve_at(None, ts(0)).session;
        let live = manager.resolve_at(None, ts(15)).session;

        assert_eq!(manager.sweep_at(ts(16)).expect("sweep"), vec![stale.id]);
        assert_eq!(backend.session_ids().expect("ids"), vec![live.id]);
    }
}
