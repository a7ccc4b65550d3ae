//! Daemon-mode durable persistence (§4.10): a `runs`/`units`/`events` schema with
//! FK cascade, so deleting a run prunes its units and events, and a strictly
//! monotonic per-database event sequence that daemon RPC watchers can resume from.
//!
//! A flat-file JSON/JSONL log is sufficient for a one-shot CLI but not for a
//! long-lived daemon juggling concurrent runs and resumable watchers, so this crate
//! uses a relational, FK-cascading, WAL-mode SQLite schema instead.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ralph_types::{Event, Run, RunStatus, UnitRuntimeState, UnitStatus};
use rusqlite::{Connection, OptionalExtension, params};

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if absent) the database at `path`, enabling WAL mode and
    /// foreign key enforcement, and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").context("failed to enable WAL mode")?;
        conn.pragma_update(None, "foreign_keys", true).context("failed to enable foreign keys")?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.pragma_update(None, "foreign_keys", true).context("failed to enable foreign keys")?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    repo_path TEXT NOT NULL,
                    target_branch TEXT NOT NULL,
                    feature_branch TEXT NOT NULL,
                    tasks_dir TEXT NOT NULL,
                    parallelism INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    error TEXT,
                    UNIQUE (feature_branch, repo_path)
                );
                CREATE TABLE IF NOT EXISTS units (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    unit_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    worktree_path TEXT,
                    branch TEXT,
                    pr_number INTEGER,
                    started_at TEXT,
                    completed_at TEXT,
                    error TEXT,
                    PRIMARY KEY (run_id, unit_id)
                );
                CREATE TABLE IF NOT EXISTS events (
                    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    unit TEXT,
                    task INTEGER,
                    pr INTEGER,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS events_run_sequence ON events(run_id, sequence);",
            )
            .context("failed to run store migrations")?;
        Ok(())
    }

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, repo_path, target_branch, feature_branch, tasks_dir, parallelism, status, started_at, completed_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.id,
                    run.repo_path.to_string_lossy(),
                    run.target_branch,
                    run.feature_branch,
                    run.tasks_dir.to_string_lossy(),
                    run.parallelism,
                    status_to_str(&run.status),
                    run.started_at.map(|t| t.to_rfc3339()),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    run.error,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    pub fn update_run_status(&self, run_id: &str, status: RunStatus, completed_at: Option<DateTime<Utc>>, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
                params![status_to_str(&status), completed_at.map(|t| t.to_rfc3339()), error, run_id],
            )
            .context("failed to update run status")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                "SELECT id, repo_path, target_branch, feature_branch, tasks_dir, parallelism, status, started_at, completed_at, error
                 FROM runs WHERE id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()
            .context("failed to query run")
    }

    /// Runs left `pending` or `running` when the daemon last stopped — candidates
    /// for resume on restart.
    pub fn resumable_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repo_path, target_branch, feature_branch, tasks_dir, parallelism, status, started_at, completed_at, error
                 FROM runs WHERE status IN ('pending', 'running') ORDER BY started_at ASC",
            )
            .context("failed to prepare resumable_runs query")?;
        let rows = stmt.query_map([], row_to_run).context("failed to run resumable_runs query")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to collect resumable runs")
    }

    pub fn upsert_unit(&self, run_id: &str, unit_id: &str, state: &UnitRuntimeState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO units (run_id, unit_id, status, worktree_path, branch, pr_number, started_at, completed_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(run_id, unit_id) DO UPDATE SET
                    status = excluded.status,
                    worktree_path = excluded.worktree_path,
                    branch = excluded.branch,
                    pr_number = excluded.pr_number,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    error = excluded.error",
                params![
                    run_id,
                    unit_id,
                    status_to_str(&state.status),
                    state.worktree_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    state.branch,
                    state.pr_number.map(|n| n as i64),
                    state.started_at.map(|t| t.to_rfc3339()),
                    state.completed_at.map(|t| t.to_rfc3339()),
                    state.error,
                ],
            )
            .context("failed to upsert unit")?;
        Ok(())
    }

    /// Append an event inside a transaction and return its assigned sequence. The
    /// whole `Event` is stored as JSON; `unit`/`task`/`pr` are duplicated into their
    /// own columns so callers can filter without deserializing every row.
    pub fn append_event(&mut self, run_id: &str, event: &Event) -> Result<i64> {
        let payload = serde_json::to_string(event).context("failed to serialize event")?;
        let tx = self.conn.transaction().context("failed to start event transaction")?;
        tx.execute(
            "INSERT INTO events (run_id, unit, task, pr, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, event.unit, event.task, event.pr.map(|n| n as i64), payload, event.timestamp.to_rfc3339()],
        )
        .context("failed to insert event")?;
        let sequence = tx.last_insert_rowid();
        tx.commit().context("failed to commit event transaction")?;
        Ok(sequence)
    }

    /// Incremental tail: every event for `run_id` with `sequence > since`, in order.
    pub fn tail_events(&self, run_id: &str, since: i64) -> Result<Vec<(i64, Event)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sequence, payload FROM events WHERE run_id = ?1 AND sequence > ?2 ORDER BY sequence ASC")
            .context("failed to prepare tail_events query")?;
        let rows = stmt
            .query_map(params![run_id, since], |row| {
                let sequence: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((sequence, payload))
            })
            .context("failed to run tail_events query")?;

        let mut out = Vec::new();
        for row in rows {
            let (sequence, payload) = row.context("failed to read event row")?;
            let event: Event = serde_json::from_str(&payload).context("failed to deserialize stored event")?;
            out.push((sequence, event));
        }
        Ok(out)
    }
}

fn status_to_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default().trim_matches('"').to_string()
}

fn str_to_status<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(&format!("\"{raw}\""))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let status_raw: String = row.get(6)?;
    Ok(Run {
        id: row.get(0)?,
        repo_path: row.get::<_, String>(1)?.into(),
        target_branch: row.get(2)?,
        feature_branch: row.get(3)?,
        tasks_dir: row.get::<_, String>(4)?.into(),
        parallelism: row.get(5)?,
        status: str_to_status::<RunStatus>(&status_raw)?,
        started_at: parse_optional_rfc3339(row.get::<_, Option<String>>(7)?),
        completed_at: parse_optional_rfc3339(row.get::<_, Option<String>>(8)?),
        error: row.get(9)?,
    })
}

fn parse_optional_rfc3339(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc))
}

/// Re-exported so callers that only need status string round-tripping (the CLI's
/// `status` subcommand) don't need their own copy.
pub fn unit_status_to_str(status: &UnitStatus) -> String {
    status_to_str(status)
}
