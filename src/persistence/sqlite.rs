//! SQLite checkpoint store.
//!
//! One row per checkpoint, JSON-encoded. A full checkpoint deletes the
//! agent's older rows, so rehydration reads at most one full checkpoint and
//! the deltas that followed it.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};

use super::{Checkpoint, Persistence, RehydrationResult};
use crate::errors::PersistenceError;

/// SQLite-backed [`Persistence`].
///
/// # Example
///
/// ```rust,no_run
/// use agent_blackboard::persistence::SqlitePersistence;
///
/// let persistence = SqlitePersistence::open("checkpoints.db").unwrap();
/// ```
#[derive(Debug)]
pub struct SqlitePersistence {
    /// Path to the database file (`:memory:` for in-memory).
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (and create if needed) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| anyhow::anyhow!("creating '{}': {}", parent.display(), e))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.to_string_lossy().into_owned())
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::with_connection(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, db_path: String) -> Result<Self, PersistenceError> {
        let persistence = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        persistence.init_db()?;
        Ok(persistence)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, anyhow::Error> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire database lock: {}", e))
    }

    fn init_db(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                full INTEGER NOT NULL,
                stored_at DATETIME NOT NULL,
                checkpoint_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_agent
             ON checkpoints(agent, id)",
            [],
        )?;
        Ok(())
    }

    /// Number of rows retained for `agent`.
    pub fn retained(&self, agent: &str) -> Result<usize, PersistenceError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE agent = ?1",
            params![agent],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl Persistence for SqlitePersistence {
    fn persist(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(checkpoint)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if checkpoint.full {
            tx.execute(
                "DELETE FROM checkpoints WHERE agent = ?1",
                params![checkpoint.agent],
            )?;
        }
        tx.execute(
            "INSERT INTO checkpoints (agent, epoch, full, stored_at, checkpoint_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checkpoint.agent,
                checkpoint.epoch as i64,
                checkpoint.full,
                Utc::now().to_rfc3339(),
                json
            ],
        )?;
        tx.commit()?;

        log::debug!(
            "SqlitePersistence::persist: agent={}, epoch={}, full={}",
            checkpoint.agent,
            checkpoint.epoch,
            checkpoint.full
        );
        Ok(())
    }

    fn rehydrate(&self, agent: &str) -> Result<Option<RehydrationResult>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT checkpoint_json FROM checkpoints
             WHERE agent = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![agent], |row| row.get::<_, String>(0))?;

        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(serde_json::from_str::<Checkpoint>(&row?)?);
        }
        Ok(RehydrationResult::fold(&checkpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn test_persist_and_rehydrate_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cp.db");

        {
            let store = SqlitePersistence::open(&path).unwrap();
            let mut full = checkpoint(1, true);
            let mut base = Envelope::persistence();
            base.bulk_add(vec![obj(1, 0)]);
            full.baseline = Some(base);
            store.persist(&full).unwrap();

            let mut delta = checkpoint(2, false);
            let mut env = Envelope::new();
            env.add_object(obj(2, 0));
            delta.envelopes.push(env);
            store.persist(&delta).unwrap();
        }

        let reopened = SqlitePersistence::open(&path).unwrap();
        let result = reopened.rehydrate("a").unwrap().unwrap();
        assert_eq!(result.epoch, 2);
        assert_eq!(result.baseline.tuples()[0].objects().len(), 2);
        assert!(reopened.rehydrate("other").unwrap().is_none());
    }

    #[test]
    fn test_full_checkpoint_compacts_rows() {
        let store = SqlitePersistence::in_memory().unwrap();
        store.persist(&checkpoint(1, true)).unwrap();
        store.persist(&checkpoint(2, false)).unwrap();
        store.persist(&checkpoint(3, false)).unwrap();
        assert_eq!(store.retained("a").unwrap(), 3);
        store.persist(&checkpoint(4, true)).unwrap();
        assert_eq!(store.retained("a").unwrap(), 1);
    }

    #[test]
    fn test_corrupt_row_is_codec_error() {
        let store = SqlitePersistence::in_memory().unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO checkpoints (agent, epoch, full, stored_at, checkpoint_json)
                 VALUES ('a', 1, 1, 'now', 'not json')",
                [],
            )
            .unwrap();
        assert!(matches!(store.rehydrate("a"), Err(PersistenceError::Codec(_))));
    }
}
