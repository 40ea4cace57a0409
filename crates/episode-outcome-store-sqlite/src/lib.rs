#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use episode_outcome_core::{
    format_rfc3339, now_utc, parse_rfc3339_lenient, CounterStore, OutcomeError, OutcomeKey,
    OutcomeRecord, OutcomeStore, OutcomeValue, TaskIdentity,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use ulid::Ulid;

const OUTCOME_SCHEMA_VERSION: i64 = 1;
const COUNTER_SCHEMA_VERSION: i64 = 1;

const SCHEMA_OUTCOME_V1: &str = r"
CREATE TABLE IF NOT EXISTS episode_tasks (
  storage_id TEXT PRIMARY KEY,
  task_id TEXT NOT NULL UNIQUE,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS episode_outcomes (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  task_storage_id TEXT NOT NULL,
  occurrence_index INTEGER NOT NULL CHECK (occurrence_index >= 0),
  values_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (task_storage_id, occurrence_index),
  FOREIGN KEY (task_storage_id) REFERENCES episode_tasks(storage_id)
);

CREATE TRIGGER IF NOT EXISTS trg_episode_outcomes_no_update
BEFORE UPDATE ON episode_outcomes
BEGIN
  SELECT RAISE(FAIL, 'episode_outcomes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_episode_outcomes_no_delete
BEFORE DELETE ON episode_outcomes
BEGIN
  SELECT RAISE(FAIL, 'episode_outcomes is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_episode_outcomes_task_seq
  ON episode_outcomes(task_storage_id, record_seq);
";

const SCHEMA_COUNTERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS allocator_counters (
  counter_key TEXT PRIMARY KEY,
  next_index INTEGER NOT NULL CHECK (next_index >= 0),
  updated_at TEXT NOT NULL
);
";

/// `SQLite` backend for episode outcomes and task registration.
pub struct SqliteOutcomeStore {
    conn: Mutex<Connection>,
}

/// `SQLite` backend for allocator counters.
///
/// Normally opened on a separate file from [`SqliteOutcomeStore`] so that the
/// two can be reset or rebuilt independently.
pub struct SqliteCounterStore {
    conn: Mutex<Connection>,
}

impl SqliteOutcomeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        apply_schema(&conn, SCHEMA_OUTCOME_V1, OUTCOME_SCHEMA_VERSION)
            .context("failed to apply outcome schema")
    }

    /// Registers `task_id` once and returns its stable identity.
    pub fn ensure_task(&self, task_id: &str, title: &str) -> Result<TaskIdentity> {
        if task_id.trim().is_empty() {
            return Err(anyhow!("task_id MUST be provided"));
        }

        let conn = self.connection();
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO episode_tasks(storage_id, task_id, title, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![Ulid::new().to_string(), task_id, title, now],
        )
        .with_context(|| format!("failed to register task {task_id}"))?;

        match find_task_in(&conn, task_id)? {
            Some(task) => Ok(task),
            None => Err(anyhow!("task {task_id} missing after registration")),
        }
    }

    pub fn find_task(&self, task_id: &str) -> Result<Option<TaskIdentity>> {
        let conn = self.connection();
        find_task_in(&conn, task_id)
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutcomeStore for SqliteOutcomeStore {
    fn insert(&self, key: &OutcomeKey, values: &[OutcomeValue]) -> Result<(), OutcomeError> {
        let occurrence_index = i64::try_from(key.occurrence_index)
            .map_err(|err| OutcomeError::io("occurrence index out of range", err))?;
        let values_json = serde_json::to_string(values)
            .map_err(|err| OutcomeError::io("failed to serialize outcome values", err))?;
        let created_at = format_rfc3339(now_utc())?;

        let conn = self.connection();
        let inserted = conn.execute(
            "INSERT INTO episode_outcomes(task_storage_id, occurrence_index, values_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key.task.storage_id.to_string(),
                occurrence_index,
                values_json,
                created_at
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(err) => Err(classify_insert_error(key, err)),
        }
    }

    fn list_all(&self, task: &TaskIdentity) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT record_seq, occurrence_index, values_json, created_at
                 FROM episode_outcomes
                 WHERE task_storage_id = ?1
                 ORDER BY record_seq ASC",
            )
            .map_err(|err| OutcomeError::io("failed to prepare outcome listing", err))?;

        let rows = stmt
            .query_map(params![task.storage_id.to_string()], |row| {
                parse_outcome_row(row, task)
            })
            .map_err(|err| OutcomeError::io("failed to list episode outcomes", err))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|err| OutcomeError::io("failed to read outcome row", err))?);
        }
        Ok(records)
    }
}

impl SqliteCounterStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        apply_schema(&conn, SCHEMA_COUNTERS_V1, COUNTER_SCHEMA_VERSION)
            .context("failed to apply counter schema")
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CounterStore for SqliteCounterStore {
    fn load(&self, key: &str) -> Result<Option<u64>, OutcomeError> {
        let conn = self.connection();
        let stored: Option<i64> = conn
            .query_row(
                "SELECT next_index FROM allocator_counters WHERE counter_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| OutcomeError::io(format!("failed to load counter {key}"), err))?;

        stored
            .map(|value| {
                u64::try_from(value)
                    .map_err(|err| OutcomeError::io(format!("invalid counter {key}"), err))
            })
            .transpose()
    }

    fn save(&self, key: &str, value: u64) -> Result<(), OutcomeError> {
        let next_index = i64::try_from(value)
            .map_err(|err| OutcomeError::io(format!("counter {key} out of range"), err))?;
        let now = format_rfc3339(now_utc())?;

        // Never lowers a stored counter, even against another process.
        let conn = self.connection();
        conn.execute(
            "INSERT INTO allocator_counters(counter_key, next_index, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(counter_key) DO UPDATE SET
               next_index = excluded.next_index,
               updated_at = excluded.updated_at
             WHERE excluded.next_index >= allocator_counters.next_index",
            params![key, next_index, now],
        )
        .map_err(|err| OutcomeError::io(format!("failed to save counter {key}"), err))?;

        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn apply_schema(conn: &Connection, schema: &str, version: i64) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    conn.execute_batch(schema)?;

    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .context("failed to register schema version")?;

    Ok(())
}

fn find_task_in(conn: &Connection, task_id: &str) -> Result<Option<TaskIdentity>> {
    let storage_id: Option<String> = conn
        .query_row(
            "SELECT storage_id FROM episode_tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up task {task_id}"))?;

    storage_id
        .map(|raw| {
            let parsed = Ulid::from_string(&raw)
                .with_context(|| format!("invalid storage_id ULID for task {task_id}: {raw}"))?;
            Ok(TaskIdentity::new(task_id, parsed))
        })
        .transpose()
}

fn classify_insert_error(key: &OutcomeKey, err: rusqlite::Error) -> OutcomeError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return OutcomeError::Conflict(key.clone());
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return OutcomeError::TaskNotFound(key.task.task_id.clone());
            }
            _ => {}
        }
    }

    OutcomeError::io("failed to insert episode outcome", err)
}

fn parse_outcome_row(row: &rusqlite::Row<'_>, task: &TaskIdentity) -> rusqlite::Result<OutcomeRecord> {
    let record_seq: i64 = row.get(0)?;
    let occurrence_index_i64: i64 = row.get(1)?;
    let values_json: String = row.get(2)?;
    let created_at_raw: String = row.get(3)?;

    let occurrence_index = u64::try_from(occurrence_index_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid occurrence_index: {occurrence_index_i64}"),
            )),
        )
    })?;

    let values = match serde_json::from_str::<Vec<OutcomeValue>>(&values_json) {
        Ok(values) => values,
        Err(err) => {
            tracing::warn!(
                record_seq,
                occurrence_index,
                error = %err,
                "unreadable outcome values, decoding with defaults"
            );
            Vec::new()
        }
    };

    let created_at = parse_rfc3339_lenient(&created_at_raw).unwrap_or_else(|| {
        tracing::warn!(record_seq, created_at = %created_at_raw, "unreadable outcome created_at");
        OffsetDateTime::UNIX_EPOCH
    });

    Ok(OutcomeRecord {
        key: OutcomeKey::new(task.clone(), occurrence_index),
        values,
        record_seq,
        created_at,
    })
}
