//! SQLite binding of the transactional store
//!
//! A [`Store`] is a handle, not a connection: it remembers where the database
//! lives and how long writers may wait for the write lock. Each operation in
//! the heartbeat registry and the outbox opens its own connection and runs a
//! single transaction, so independent processes and threads coordinate only
//! through the database file.

mod schema;

use crate::config::StoreConfig;
use crate::error::{CoordError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Store {
    /// Open (creating if needed) the database at `db_path` with the default busy timeout.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(db_path, StoreConfig::default().busy_timeout())
    }

    /// Open the database described by `config`, resolving the default path under `home`.
    pub fn from_config(config: &StoreConfig, home: &Path) -> Result<Self> {
        Self::open_with(config.database_path(home), config.busy_timeout())
    }

    pub fn open_with(db_path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoordError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let store = Self {
            db_path,
            busy_timeout,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(schema::MIGRATIONS)?;
        Ok(())
    }

    /// Fresh connection with the store's pragmas applied.
    pub(crate) fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }
}

/// Begin a write transaction that takes the database write lock up front.
pub(crate) fn begin_write(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Epoch-millisecond boundary `age` before `now`.
pub(crate) fn cutoff_ms(now: DateTime<Utc>, age: Duration) -> i64 {
    let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    to_ms(now).saturating_sub(age_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_and_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/dir/coord.db");

        let store = Store::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(store.path(), db_path.as_path());

        let conn = store.connect().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert!(tables.contains(&"heartbeats".to_string()));
        assert!(tables.contains(&"messages".to_string()));
        assert!(tables.contains(&"messages_history".to_string()));
    }

    #[test]
    fn test_open_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("coord.db");
        Store::open(&db_path).unwrap();
        Store::open(&db_path).unwrap();
    }

    #[test]
    fn test_sentinel_without_overflow_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path().join("coord.db")).unwrap();
        let conn = store.connect().unwrap();

        let err = conn
            .execute(
                "INSERT INTO messages (id, created_at_ms, event_type, payload, services, bucket)
                 VALUES ('m1', 0, 'NEW_DID', 'nolimit', 'activemq', 0)",
                [],
            )
            .unwrap_err();
        assert!(crate::error::is_constraint_violation(&err));
    }

    #[test]
    fn test_time_helpers() {
        let now = from_ms(10_000);
        assert_eq!(to_ms(now), 10_000);
        assert_eq!(cutoff_ms(now, Duration::from_secs(3)), 7_000);
        assert_eq!(cutoff_ms(now, Duration::MAX), 10_000 - i64::MAX);
    }
}
