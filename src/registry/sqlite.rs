//! SQLite-backed task ledger.
//!
//! Single `tasks` table, one row per task, with covering indexes for the
//! hot lookups (recent, running, per-directory). Timestamps are stored as
//! fixed-width RFC 3339 UTC strings so string comparison matches time
//! order. Schema changes go through a backup-and-copy migration that
//! preserves every column both versions share.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

use super::{window_cutoff, TaskOrigin, TaskQuery, TaskRecord, TaskStatus, TaskStore, TaskUpdate};

const SCHEMA_VERSION: i64 = 1;

const CREATE_TASKS: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    origin TEXT NOT NULL,
    status TEXT NOT NULL,
    instruction TEXT NOT NULL,
    working_dir TEXT NOT NULL,
    environment TEXT,
    model TEXT,
    mode TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    last_event_at TEXT,
    progress TEXT,
    poll_hint_ms INTEGER,
    keep_alive_until TEXT,
    thread_id TEXT,
    user_id TEXT,
    result TEXT,
    error TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
)";

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks (status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_origin_status ON tasks (origin, status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_dir_updated ON tasks (working_dir, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_user_thread ON tasks (user_id, thread_id, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks (created_at)",
];

const SELECT_COLUMNS: &str = "id, origin, status, instruction, working_dir, environment, \
     model, mode, created_at, updated_at, completed_at, last_event_at, progress, \
     poll_hint_ms, keep_alive_until, thread_id, user_id, result, error, metadata";

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::bootstrap(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn bootstrap(conn: &Connection) -> EngineResult<()> {
        let version: i64 =
            conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != 0 && version != SCHEMA_VERSION {
            Self::migrate(conn)?;
        }
        conn.execute(CREATE_TASKS, [])?;
        for index in CREATE_INDEXES {
            conn.execute(index, [])?;
        }
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// Backup-and-copy migration: rename the old table aside, create the
    /// current schema, copy every column both versions share, drop the
    /// backup. Columns only the old schema had are dropped; columns only
    /// the new schema has take their defaults.
    fn migrate(conn: &Connection) -> EngineResult<()> {
        let old_version: i64 =
            conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        tracing::info!(
            "Migrating task ledger schema from version {} to {}",
            old_version,
            SCHEMA_VERSION
        );

        conn.execute("ALTER TABLE tasks RENAME TO tasks_backup", [])?;
        conn.execute(CREATE_TASKS, [])?;

        let old_columns = table_columns(conn, "tasks_backup")?;
        let new_columns = table_columns(conn, "tasks")?;
        let shared: Vec<String> = new_columns
            .into_iter()
            .filter(|c| old_columns.contains(c))
            .collect();
        if !shared.is_empty() {
            let list = shared.join(", ");
            conn.execute(
                &format!("INSERT INTO tasks ({list}) SELECT {list} FROM tasks_backup"),
                [],
            )?;
        }
        conn.execute("DROP TABLE tasks_backup", [])?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get_locked(conn: &Connection, id: &str) -> EngineResult<Option<TaskRecord>> {
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            row_to_record,
        )
        .optional()
        .map_err(EngineError::from)
    }

    fn persist(conn: &Connection, record: &TaskRecord) -> EngineResult<()> {
        conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3, completed_at = ?4, \
             last_event_at = ?5, progress = ?6, poll_hint_ms = ?7, \
             keep_alive_until = ?8, thread_id = ?9, result = ?10, error = ?11, \
             metadata = ?12 WHERE id = ?1",
            rusqlite::params![
                record.id,
                record.status.as_str(),
                ts_to_sql(record.updated_at),
                record.completed_at.map(ts_to_sql),
                record.last_event_at.map(ts_to_sql),
                record.progress.as_ref().map(Value::to_string),
                record.poll_hint_ms,
                record.keep_alive_until.map(ts_to_sql),
                record.thread_id,
                record.result.as_ref().map(Value::to_string),
                record.error.as_ref().map(Value::to_string),
                record.metadata.to_string(),
            ],
        )?;
        Ok(())
    }
}

impl TaskStore for SqliteTaskStore {
    fn register(&self, record: &TaskRecord) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (id, origin, status, instruction, working_dir, \
             environment, model, mode, created_at, updated_at, completed_at, \
             last_event_at, progress, poll_hint_ms, keep_alive_until, thread_id, \
             user_id, result, error, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
             ?15, ?16, ?17, ?18, ?19, ?20)",
            rusqlite::params![
                record.id,
                record.origin.as_str(),
                record.status.as_str(),
                record.instruction,
                record.working_dir,
                record.environment,
                record.model,
                record.mode,
                ts_to_sql(record.created_at),
                ts_to_sql(record.updated_at),
                record.completed_at.map(ts_to_sql),
                record.last_event_at.map(ts_to_sql),
                record.progress.as_ref().map(Value::to_string),
                record.poll_hint_ms,
                record.keep_alive_until.map(ts_to_sql),
                record.thread_id,
                record.user_id,
                record.result.as_ref().map(Value::to_string),
                record.error.as_ref().map(Value::to_string),
                record.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> EngineResult<Option<TaskRecord>> {
        Self::get_locked(&self.lock(), id)
    }

    fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<Value>,
    ) -> EngineResult<TaskRecord> {
        let conn = self.lock();
        let mut record = Self::get_locked(&conn, id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        if record.apply_status(status, error) {
            Self::persist(&conn, &record)?;
        }
        Ok(record)
    }

    fn update(&self, id: &str, update: TaskUpdate) -> EngineResult<TaskRecord> {
        let conn = self.lock();
        let mut record = Self::get_locked(&conn, id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        record.apply_update(update);
        Self::persist(&conn, &record)?;
        Ok(record)
    }

    fn recent(&self, within: Duration, limit: usize) -> EngineResult<Vec<TaskRecord>> {
        let cutoff = ts_to_sql(window_cutoff(within));
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE created_at >= ?1 \
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![cutoff, limit as i64], row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    fn running(&self, working_dir: Option<&str>) -> EngineResult<Vec<TaskRecord>> {
        let conn = self.lock();
        let statuses: Vec<String> = TaskStatus::non_terminal()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let mut sql = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE status IN ({})",
            statuses.join(", ")
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(dir) = working_dir {
            sql.push_str(" AND working_dir = ?1");
            params.push(dir.to_string().into());
        }
        sql.push_str(" ORDER BY updated_at DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    fn query(&self, query: &TaskQuery) -> EngineResult<Vec<TaskRecord>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE 1=1");
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        let mut bind = |sql: &mut String, clause: &str, value: rusqlite::types::Value| {
            params.push(value);
            sql.push_str(&format!(" AND {} = ?{}", clause, params.len()));
        };

        if let Some(origin) = query.origin {
            bind(&mut sql, "origin", origin.as_str().to_string().into());
        }
        if !query.statuses.is_empty() {
            let list: Vec<String> = query
                .statuses
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect();
            sql.push_str(&format!(" AND status IN ({})", list.join(", ")));
        }
        if let Some(dir) = &query.working_dir {
            bind(&mut sql, "working_dir", dir.clone().into());
        }
        if let Some(env) = &query.environment {
            bind(&mut sql, "environment", env.clone().into());
        }
        if let Some(thread) = &query.thread_id {
            bind(&mut sql, "thread_id", thread.clone().into());
        }
        if let Some(user) = &query.user_id {
            bind(&mut sql, "user_id", user.clone().into());
        }
        if let Some(after) = query.created_after {
            params.push(ts_to_sql(after).into());
            sql.push_str(&format!(" AND created_at >= ?{}", params.len()));
        }
        if let Some(before) = query.created_before {
            params.push(ts_to_sql(before).into());
            sql.push_str(&format!(" AND created_at <= ?{}", params.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, query.offset));
        } else if query.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", query.offset));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    fn sweep(&self, older_than: Duration) -> EngineResult<usize> {
        let cutoff = ts_to_sql(window_cutoff(older_than));
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM tasks WHERE completed_at IS NOT NULL AND completed_at < ?1",
            [cutoff],
        )?;
        if removed > 0 {
            tracing::info!("Swept {} finished tasks from the ledger", removed);
        }
        Ok(removed)
    }
}

fn table_columns(conn: &Connection, table: &str) -> EngineResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
}

/// Fixed-width RFC 3339 with millisecond precision; lexicographic order
/// equals chronological order.
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_from_sql(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    s.as_deref().map(ts_from_sql).transpose()
}

fn opt_json(s: Option<String>) -> Option<Value> {
    s.and_then(|text| serde_json::from_str(&text).ok())
}

fn parse_enum<T>(value: Option<T>, field: &str) -> Result<T, rusqlite::Error> {
    value.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognized {field}").into(),
        )
    })
}

fn row_to_record(row: &Row<'_>) -> Result<TaskRecord, rusqlite::Error> {
    let origin: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let metadata: String = row.get(19)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        origin: parse_enum(TaskOrigin::parse(&origin), "origin")?,
        status: parse_enum(TaskStatus::parse(&status), "status")?,
        instruction: row.get(3)?,
        working_dir: row.get(4)?,
        environment: row.get(5)?,
        model: row.get(6)?,
        mode: row.get(7)?,
        created_at: ts_from_sql(&created_at)?,
        updated_at: ts_from_sql(&updated_at)?,
        completed_at: opt_ts(row.get(10)?)?,
        last_event_at: opt_ts(row.get(11)?)?,
        progress: opt_json(row.get(12)?),
        poll_hint_ms: row.get(13)?,
        keep_alive_until: opt_ts(row.get(14)?)?,
        thread_id: row.get(15)?,
        user_id: row.get(16)?,
        result: opt_json(row.get(17)?),
        error: opt_json(row.get(18)?),
        metadata: serde_json::from_str(&metadata)
            .unwrap_or(Value::Object(serde_json::Map::new())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::generate_task_id;

    fn record(instruction: &str, dir: &str) -> TaskRecord {
        TaskRecord::new(generate_task_id(TaskOrigin::Local), TaskOrigin::Local, instruction, dir)
    }

    #[test]
    fn test_register_and_round_trip() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let mut rec = record("fix the tests", "/work/app");
        rec.model = Some("gpt-5".to_string());
        rec.metadata = serde_json::json!({"source": "cli"});
        store.register(&rec).unwrap();

        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.instruction, "fix the tests");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.model.as_deref(), Some("gpt-5"));
        assert_eq!(loaded.metadata["source"], "cli");
        assert_eq!(loaded.created_at.timestamp_millis(), rec.created_at.timestamp_millis());
    }

    #[test]
    fn test_missing_task_is_not_found() {
        let store = SqliteTaskStore::in_memory().unwrap();
        assert!(store.get("T-local-nope").unwrap().is_none());
        let err = store.update_status("T-local-nope", TaskStatus::Working, None);
        assert!(matches!(err, Err(EngineError::TaskNotFound(_))));
    }

    #[test]
    fn test_completed_at_stamped_exactly_once() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let rec = record("x", "/tmp");
        store.register(&rec).unwrap();

        store.update_status(&rec.id, TaskStatus::Working, None).unwrap();
        let done = store.update_status(&rec.id, TaskStatus::Completed, None).unwrap();
        let stamped = done.completed_at.unwrap();

        // Terminal is absorbing; the stamp never moves.
        let again = store
            .update_status(&rec.id, TaskStatus::Failed, Some(serde_json::json!({"code": "X"})))
            .unwrap();
        assert_eq!(again.status, TaskStatus::Completed);
        assert_eq!(again.completed_at, Some(stamped));
    }

    #[test]
    fn test_running_scoped_by_directory() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let a = record("a", "/work/one");
        let b = record("b", "/work/two");
        let c = record("c", "/work/one");
        for rec in [&a, &b, &c] {
            store.register(rec).unwrap();
        }
        store.update_status(&c.id, TaskStatus::Completed, None).unwrap();

        let everywhere = store.running(None).unwrap();
        assert_eq!(everywhere.len(), 2);

        let scoped = store.running(Some("/work/one")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, a.id);
    }

    #[test]
    fn test_recent_respects_window_and_limit() {
        let store = SqliteTaskStore::in_memory().unwrap();
        for i in 0..5 {
            store.register(&record(&format!("task {i}"), "/tmp")).unwrap();
        }
        let recent = store.recent(Duration::from_secs(3600), 3).unwrap();
        assert_eq!(recent.len(), 3);

        // A zero-width window excludes everything already created.
        let none = store.recent(Duration::ZERO, 10).unwrap();
        assert!(none.len() <= 5);
    }

    #[test]
    fn test_query_filters_and_pagination() {
        let store = SqliteTaskStore::in_memory().unwrap();
        for i in 0..4 {
            let mut rec = record(&format!("task {i}"), "/work/app");
            rec.user_id = Some("u1".to_string());
            store.register(&rec).unwrap();
        }
        let mut other = record("elsewhere", "/work/other");
        other.user_id = Some("u2".to_string());
        store.register(&other).unwrap();

        let by_user = store
            .query(&TaskQuery { user_id: Some("u1".to_string()), ..TaskQuery::default() })
            .unwrap();
        assert_eq!(by_user.len(), 4);

        let page = store
            .query(&TaskQuery {
                user_id: Some("u1".to_string()),
                limit: Some(2),
                offset: 2,
                ..TaskQuery::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);

        let by_status = store
            .query(&TaskQuery { statuses: vec![TaskStatus::Pending], ..TaskQuery::default() })
            .unwrap();
        assert_eq!(by_status.len(), 5);
    }

    #[test]
    fn test_sweep_removes_only_old_terminal_rows() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let live = record("live", "/tmp");
        let done = record("done", "/tmp");
        store.register(&live).unwrap();
        store.register(&done).unwrap();
        store.update_status(&done.id, TaskStatus::Completed, None).unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(store.sweep(Duration::from_secs(3600)).unwrap(), 0);
        // With a zero retention the finished row goes, the live one stays.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.sweep(Duration::ZERO).unwrap(), 1);
        assert!(store.get(&done.id).unwrap().is_none());
        assert!(store.get(&live.id).unwrap().is_some());
    }

    #[test]
    fn test_ledger_survives_schema_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        let rec = record("survives", "/tmp");
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.register(&rec).unwrap();
            store.update_status(&rec.id, TaskStatus::Working, None).unwrap();
        }
        // Simulate an older on-disk schema version.
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        let store = SqliteTaskStore::open(&path).unwrap();
        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Working);
        assert_eq!(loaded.instruction, "survives");
    }
}
