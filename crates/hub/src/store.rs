// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable session, executor, key, and config records over SQLite.
//!
//! Single-writer discipline: one connection behind a mutex, transactions
//! for multi-row updates. Readers go through the same connection; the
//! store is not a hot path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use roost_core::epoch_ms;
use roost_core::record::{
    ExecutorKeyRecord, ExecutorRecord, ExecutorStatus, SessionMode, SessionRecord,
};

/// Store-level failures the manager distinguishes.
#[derive(Debug)]
pub enum StoreError {
    NameTaken,
    NotFound,
    Db(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTaken => f.write_str("name already taken"),
            Self::NotFound => f.write_str("record not found"),
            Self::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::NameTaken
            }
            other => Self::Db(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    name          TEXT PRIMARY KEY,
    description   TEXT NOT NULL DEFAULT '',
    mode          TEXT NOT NULL,
    command       TEXT NOT NULL,
    executor_id   TEXT NOT NULL DEFAULT 'local',
    owner_id      TEXT NOT NULL,
    parent_name   TEXT,
    job_prompt    TEXT,
    order_index   INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    last_activity INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id, order_index);

CREATE TABLE IF NOT EXISTS executors (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    labels        TEXT NOT NULL DEFAULT '',
    status        TEXT NOT NULL,
    version       TEXT NOT NULL DEFAULT '',
    last_seen     INTEGER NOT NULL,
    session_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS executor_keys (
    id           TEXT PRIMARY KEY,
    owner_id     TEXT NOT NULL,
    name         TEXT NOT NULL,
    prefix       TEXT NOT NULL,
    hashed_token TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    expires_at   INTEGER
);

CREATE TABLE IF NOT EXISTS config (
    owner_id TEXT NOT NULL,
    key      TEXT NOT NULL,
    value    TEXT NOT NULL,
    PRIMARY KEY (owner_id, key)
);
";

/// SQLite-backed store for all durable hub state.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (creating if needed) the database at `DATA_DIR/sessions.db`.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("sessions.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -- sessions -------------------------------------------------------------

    /// Insert a new session record. Fails with [`StoreError::NameTaken`]
    /// when the name exists, regardless of owner or executor.
    pub fn create_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (name, description, mode, command, executor_id, owner_id,
                                   parent_name, job_prompt, order_index, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.name,
                record.description,
                record.mode.as_str(),
                record.command,
                record.executor_id,
                record.owner_id,
                record.parent_name,
                record.job_prompt,
                record.order_index,
                record.created_at as i64,
                record.last_activity as i64,
            ],
        )?;
        Ok(())
    }

    /// Fetch one session scoped to its owner. Cross-owner access reads as
    /// absent, never as forbidden.
    pub fn get_session(&self, owner_id: &str, name: &str) -> StoreResult<SessionRecord> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT name, description, mode, command, executor_id, owner_id, parent_name,
                        job_prompt, order_index, created_at, last_activity
                 FROM sessions WHERE name = ?1 AND owner_id = ?2",
                params![name, owner_id],
                row_to_session,
            )
            .optional()?;
        record.ok_or(StoreError::NotFound)
    }

    /// Fetch one session by name regardless of owner (inventory reconcile).
    pub fn session_by_name(&self, name: &str) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT name, description, mode, command, executor_id, owner_id, parent_name,
                        job_prompt, order_index, created_at, last_activity
                 FROM sessions WHERE name = ?1",
                params![name],
                row_to_session,
            )
            .optional()?)
    }

    /// Whether any session (any owner) holds this name.
    pub fn name_exists(&self, name: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All sessions for one owner ordered by `order_index` ascending.
    pub fn list_sessions(&self, owner_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, description, mode, command, executor_id, owner_id, parent_name,
                    job_prompt, order_index, created_at, last_activity
             FROM sessions WHERE owner_id = ?1 ORDER BY order_index ASC",
        )?;
        let rows = stmt.query_map(params![owner_id], row_to_session)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All sessions placed on one executor, any owner.
    pub fn list_sessions_for_executor(&self, executor_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, description, mode, command, executor_id, owner_id, parent_name,
                    job_prompt, order_index, created_at, last_activity
             FROM sessions WHERE executor_id = ?1 ORDER BY order_index ASC",
        )?;
        let rows = stmt.query_map(params![executor_id], row_to_session)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete an owner's session. Returns whether a row was removed.
    pub fn delete_session(&self, owner_id: &str, name: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM sessions WHERE name = ?1 AND owner_id = ?2",
            params![name, owner_id],
        )?;
        Ok(n > 0)
    }

    /// Next free `order_index` for an owner.
    pub fn next_order_index(&self, owner_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(order_index) FROM sessions WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Reassign `order_index` so `names` occupy positions `0..` in the
    /// given order; unknown names are ignored and unlisted sessions keep
    /// their relative order after the listed ones.
    pub fn reorder_sessions(&self, owner_id: &str, names: &[String]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let current: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT name FROM sessions WHERE owner_id = ?1 ORDER BY order_index ASC",
                )?;
                let rows = stmt.query_map(params![owner_id], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let mut index = 0i64;
            let mut assign = |name: &str, tx: &rusqlite::Transaction<'_>| -> rusqlite::Result<()> {
                tx.execute(
                    "UPDATE sessions SET order_index = ?1 WHERE name = ?2 AND owner_id = ?3",
                    params![index, name, owner_id],
                )?;
                index += 1;
                Ok(())
            };

            for name in names {
                if current.iter().any(|c| c == name) {
                    assign(name, &tx)?;
                }
            }
            for name in &current {
                if !names.contains(name) {
                    assign(name, &tx)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Bump a session's activity timestamp.
    pub fn touch_activity(&self, name: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE name = ?2",
            params![epoch_ms() as i64, name],
        )?;
        Ok(())
    }

    /// Update a session's description (owner-scoped).
    pub fn set_description(&self, owner_id: &str, name: &str, description: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE sessions SET description = ?1 WHERE name = ?2 AND owner_id = ?3",
            params![description, name, owner_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // -- executors ------------------------------------------------------------

    /// Insert or refresh an executor record on handshake.
    pub fn upsert_executor(&self, record: &ExecutorRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO executors (id, name, labels, status, version, last_seen, session_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 labels = excluded.labels,
                 status = excluded.status,
                 version = excluded.version,
                 last_seen = excluded.last_seen,
                 session_count = excluded.session_count",
            params![
                record.id,
                record.name,
                record.labels.join(","),
                record.status.as_str(),
                record.version,
                record.last_seen as i64,
                record.session_count,
            ],
        )?;
        Ok(())
    }

    /// Flip an executor's status, refreshing `last_seen`.
    pub fn set_executor_status(&self, id: &str, status: ExecutorStatus) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE executors SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status.as_str(), epoch_ms() as i64, id],
        )?;
        Ok(())
    }

    pub fn set_executor_session_count(&self, id: &str, count: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE executors SET session_count = ?1 WHERE id = ?2",
            params![count, id],
        )?;
        Ok(())
    }

    pub fn get_executor(&self, id: &str) -> StoreResult<Option<ExecutorRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, labels, status, version, last_seen, session_count
                 FROM executors WHERE id = ?1",
                params![id],
                row_to_executor,
            )
            .optional()?)
    }

    pub fn list_executors(&self) -> StoreResult<Vec<ExecutorRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, labels, status, version, last_seen, session_count
             FROM executors ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_executor)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -- executor keys --------------------------------------------------------

    pub fn create_key(&self, record: &ExecutorKeyRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO executor_keys (id, owner_id, name, prefix, hashed_token, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.owner_id,
                record.name,
                record.prefix,
                record.hashed_token,
                record.created_at as i64,
                record.expires_at.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn list_keys(&self, owner_id: &str) -> StoreResult<Vec<ExecutorKeyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, name, prefix, hashed_token, created_at, expires_at
             FROM executor_keys WHERE owner_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![owner_id], row_to_key)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete an owner's key. Returns whether a row was removed.
    pub fn delete_key(&self, owner_id: &str, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM executor_keys WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )?;
        Ok(n > 0)
    }

    /// Look up a key by token digest, filtering out expired keys.
    pub fn find_key_by_hash(&self, hashed_token: &str) -> StoreResult<Option<ExecutorKeyRecord>> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                "SELECT id, owner_id, name, prefix, hashed_token, created_at, expires_at
                 FROM executor_keys WHERE hashed_token = ?1",
                params![hashed_token],
                row_to_key,
            )
            .optional()?;
        Ok(key.filter(|k| k.expires_at.is_none_or(|exp| exp > epoch_ms())))
    }

    // -- config ---------------------------------------------------------------

    pub fn set_config(&self, owner_id: &str, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config (owner_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner_id, key) DO UPDATE SET value = excluded.value",
            params![owner_id, key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, owner_id: &str, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM config WHERE owner_id = ?1 AND key = ?2",
                params![owner_id, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_all_config(&self, owner_id: &str) -> StoreResult<BTreeMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM config WHERE owner_id = ?1 ORDER BY key ASC")?;
        let rows = stmt.query_map(params![owner_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let mode_str: String = row.get(2)?;
    let mode = SessionMode::from_str(&mode_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("bad session mode: {mode_str}").into(),
        )
    })?;
    Ok(SessionRecord {
        name: row.get(0)?,
        description: row.get(1)?,
        mode,
        command: row.get(3)?,
        executor_id: row.get(4)?,
        owner_id: row.get(5)?,
        parent_name: row.get(6)?,
        job_prompt: row.get(7)?,
        order_index: row.get(8)?,
        created_at: row.get::<_, i64>(9)? as u64,
        last_activity: row.get::<_, i64>(10)? as u64,
    })
}

fn row_to_executor(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutorRecord> {
    let labels: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(ExecutorRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        labels: if labels.is_empty() {
            vec![]
        } else {
            labels.split(',').map(str::to_owned).collect()
        },
        status: if status == "online" { ExecutorStatus::Online } else { ExecutorStatus::Offline },
        version: row.get(4)?,
        last_seen: row.get::<_, i64>(5)? as u64,
        session_count: row.get(6)?,
    })
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutorKeyRecord> {
    Ok(ExecutorKeyRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        prefix: row.get(3)?,
        hashed_token: row.get(4)?,
        created_at: row.get::<_, i64>(5)? as u64,
        expires_at: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
