//! `SQLite` persistence backend.
//!
//! Stores time jobs, cron definitions and cron occurrences in three tables:
//! - Write-Ahead Logging (WAL) so several processes can share one file
//! - Automatic schema migration on open
//! - Claims and transitions as single conditional `UPDATE` statements
//! - `UNIQUE(cron_id, execution_time)` on occurrences
//!
//! # Example
//!
//! ```rust,ignore
//! use ticker_core::backends::SqliteStore;
//!
//! let store = SqliteStore::new("./data/ticker.db").await?;
//! let due = store.find_due_time_jobs(Utc::now(), 100).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use super::{JobFilter, PersistenceStore, ReleaseSummary};
use crate::domain::{
    CronDefinition, CronOccurrence, ExecutionState, JobKind, JobStatus, RunCondition, TimeJob,
    Transition,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TERMINAL: &str = "('Done', 'DueDone', 'Failed', 'Cancelled', 'Skipped')";

const TIME_JOB_COLUMNS: &str = "id, function, description, request, execution_time, retries, \
     retry_intervals, parent_id, run_condition, status, executed_at, elapsed_ms, retry_count, \
     lock_holder, locked_at, exception, skipped_reason, created_at, updated_at";

const OCCURRENCE_COLUMNS: &str = "id, cron_id, execution_time, status, executed_at, elapsed_ms, \
     retry_count, lock_holder, locked_at, exception, skipped_reason, created_at, updated_at";

const DEFINITION_COLUMNS: &str =
    "id, function, expression, description, request, retries, retry_intervals, created_at, updated_at";

/// SQLite-backed persistence store.
///
/// Each operation opens its own connection on the blocking thread pool.
/// `SQLite`'s WAL mode and busy timeout serialize concurrent writers, which
/// is what makes the conditional claim safe across processes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// Path to the database file, or a shared-cache memory URI.
    db_path: PathBuf,

    /// Keeps a shared in-memory database alive between operations.
    _keeper: Option<Arc<Mutex<Connection>>>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    ///
    /// `:memory:` creates a private in-memory database that lives as long as
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated.
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let mut db_path = path.into();
        let mut keeper = None;

        if db_path.to_str() == Some(":memory:") {
            db_path = PathBuf::from(format!("file:ticker-{}?mode=memory&cache=shared", Uuid::new_v4()));
            let conn = Self::open(&db_path).context("Failed to open in-memory database")?;
            keeper = Some(Arc::new(Mutex::new(conn)));
        } else if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }

        let store = Self {
            db_path,
            _keeper: keeper,
        };
        store.migrate_schema().await?;
        Ok(store)
    }

    fn open(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).context("Failed to open database")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        Ok(conn)
    }

    /// Run `f` with a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = Self::open(&db_path)?;
            f(&mut conn)
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    async fn migrate_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            // Not supported for memory databases; ignore the answer there.
            conn.pragma_update(None, "journal_mode", "WAL").ok();

            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS time_jobs (
                    id TEXT PRIMARY KEY,
                    function TEXT NOT NULL,
                    description TEXT,
                    request BLOB,
                    execution_time INTEGER,
                    retries INTEGER NOT NULL DEFAULT 0,
                    retry_intervals TEXT NOT NULL DEFAULT '[]',
                    parent_id TEXT,
                    run_condition TEXT,
                    status TEXT NOT NULL,
                    executed_at INTEGER,
                    elapsed_ms INTEGER,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    lock_holder TEXT,
                    locked_at INTEGER,
                    exception TEXT,
                    skipped_reason TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_time_jobs_due
                    ON time_jobs(status, execution_time);
                CREATE INDEX IF NOT EXISTS idx_time_jobs_parent
                    ON time_jobs(parent_id);

                CREATE TABLE IF NOT EXISTS cron_definitions (
                    id TEXT PRIMARY KEY,
                    function TEXT NOT NULL,
                    expression TEXT NOT NULL,
                    description TEXT,
                    request BLOB,
                    retries INTEGER NOT NULL DEFAULT 0,
                    retry_intervals TEXT NOT NULL DEFAULT '[]',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_cron_definitions_seed
                    ON cron_definitions(function, expression);

                CREATE TABLE IF NOT EXISTS cron_occurrences (
                    id TEXT PRIMARY KEY,
                    cron_id TEXT NOT NULL,
                    execution_time INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    executed_at INTEGER,
                    elapsed_ms INTEGER,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    lock_holder TEXT,
                    locked_at INTEGER,
                    exception TEXT,
                    skipped_reason TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE(cron_id, execution_time)
                );
                CREATE INDEX IF NOT EXISTS idx_cron_occurrences_due
                    ON cron_occurrences(status, execution_time);
                ",
            )
            .context("Failed to create tables")?;
            Ok(())
        })
        .await
    }

    fn table(kind: JobKind) -> &'static str {
        match kind {
            JobKind::Time => "time_jobs",
            JobKind::Cron => "cron_occurrences",
        }
    }
}

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {micros}")))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => time_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn intervals_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<u32>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn status_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| conversion_error(idx, e))
}

/// Read the eight execution-state columns starting at `offset`.
fn state_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<ExecutionState> {
    Ok(ExecutionState {
        status: status_at(row, offset)?,
        executed_at: opt_time_at(row, offset + 1)?,
        elapsed_ms: row.get(offset + 2)?,
        retry_count: row.get(offset + 3)?,
        lock_holder: row.get(offset + 4)?,
        locked_at: opt_time_at(row, offset + 5)?,
        exception: row.get(offset + 6)?,
        skipped_reason: row.get(offset + 7)?,
    })
}

fn time_job_from_row(row: &Row<'_>) -> rusqlite::Result<TimeJob> {
    let parent_id = match row.get::<_, Option<String>>(7)? {
        Some(text) => Some(Uuid::parse_str(&text).map_err(|e| conversion_error(7, e))?),
        None => None,
    };
    let run_condition = match row.get::<_, Option<String>>(8)? {
        Some(text) => Some(
            text.parse::<RunCondition>()
                .map_err(|e| conversion_error(8, e))?,
        ),
        None => None,
    };
    Ok(TimeJob {
        id: uuid_at(row, 0)?,
        function: row.get(1)?,
        description: row.get(2)?,
        request: row.get(3)?,
        execution_time: opt_time_at(row, 4)?,
        retries: row.get(5)?,
        retry_intervals: intervals_at(row, 6)?,
        parent_id,
        run_condition,
        state: state_at(row, 9)?,
        created_at: time_at(row, 17)?,
        updated_at: time_at(row, 18)?,
    })
}

fn occurrence_from_row(row: &Row<'_>) -> rusqlite::Result<CronOccurrence> {
    Ok(CronOccurrence {
        id: uuid_at(row, 0)?,
        cron_id: uuid_at(row, 1)?,
        execution_time: time_at(row, 2)?,
        state: state_at(row, 3)?,
        created_at: time_at(row, 11)?,
        updated_at: time_at(row, 12)?,
    })
}

fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<CronDefinition> {
    Ok(CronDefinition {
        id: uuid_at(row, 0)?,
        function: row.get(1)?,
        expression: row.get(2)?,
        description: row.get(3)?,
        request: row.get(4)?,
        retries: row.get(5)?,
        retry_intervals: intervals_at(row, 6)?,
        created_at: time_at(row, 7)?,
        updated_at: time_at(row, 8)?,
    })
}

fn query_time_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<TimeJob>> {
    let mut stmt = conn.prepare(sql).context("Failed to prepare time job query")?;
    let rows = stmt
        .query_map(params, time_job_from_row)
        .context("Failed to execute time job query")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read time job row")
}

fn query_occurrences(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<CronOccurrence>> {
    let mut stmt = conn.prepare(sql).context("Failed to prepare occurrence query")?;
    let rows = stmt
        .query_map(params, occurrence_from_row)
        .context("Failed to execute occurrence query")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read occurrence row")
}

fn insert_time_job(conn: &Connection, job: &TimeJob) -> Result<()> {
    let intervals = serde_json::to_string(&job.retry_intervals)?;
    conn.execute(
        &format!(
            "INSERT INTO time_jobs ({TIME_JOB_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            job.id.to_string(),
            job.function,
            job.description,
            job.request,
            job.execution_time.map(ts),
            job.retries,
            intervals,
            job.parent_id.map(|id| id.to_string()),
            job.run_condition.map(RunCondition::as_str),
            job.state.status.as_str(),
            job.state.executed_at.map(ts),
            job.state.elapsed_ms,
            job.state.retry_count,
            job.state.lock_holder,
            job.state.locked_at.map(ts),
            job.state.exception,
            job.state.skipped_reason,
            ts(job.created_at),
            ts(job.updated_at),
        ],
    )
    .with_context(|| format!("Failed to insert time job {}", job.id))?;
    Ok(())
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn insert_time_jobs(&self, jobs: &[TimeJob]) -> Result<()> {
        let jobs = jobs.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            for job in &jobs {
                insert_time_job(&tx, job)?;
            }
            tx.commit().context("Failed to commit time jobs")
        })
        .await
    }

    async fn get_time_job(&self, id: Uuid) -> Result<Option<TimeJob>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {TIME_JOB_COLUMNS} FROM time_jobs WHERE id = ?1"),
                params![id.to_string()],
                time_job_from_row,
            )
            .optional()
            .context("Failed to load time job")
        })
        .await
    }

    async fn update_time_job(&self, job: &TimeJob, expected: JobStatus) -> Result<bool> {
        let job = job.clone();
        self.with_conn(move |conn| {
            let intervals = serde_json::to_string(&job.retry_intervals)?;
            let changed = conn
                .execute(
                    r"
                    UPDATE time_jobs
                    SET function = ?1, description = ?2, request = ?3, execution_time = ?4,
                        retries = ?5, retry_intervals = ?6, updated_at = ?7
                    WHERE id = ?8 AND status = ?9
                    ",
                    params![
                        job.function,
                        job.description,
                        job.request,
                        job.execution_time.map(ts),
                        job.retries,
                        intervals,
                        ts(job.updated_at),
                        job.id.to_string(),
                        expected.as_str(),
                    ],
                )
                .context("Failed to update time job")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_time_jobs(&self, ids: &[Uuid]) -> Result<u64> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let mut removed = 0u64;
            for id in &ids {
                removed += tx
                    .execute(
                        "DELETE FROM time_jobs WHERE id = ?1 AND status != 'InProgress'",
                        params![id.to_string()],
                    )
                    .context("Failed to delete time job")? as u64;
            }
            tx.commit().context("Failed to commit delete")?;
            Ok(removed)
        })
        .await
    }

    async fn children(&self, parent_id: Uuid) -> Result<Vec<TimeJob>> {
        self.with_conn(move |conn| {
            query_time_jobs(
                conn,
                &format!(
                    "SELECT {TIME_JOB_COLUMNS} FROM time_jobs WHERE parent_id = ?1 ORDER BY created_at"
                ),
                params![parent_id.to_string()],
            )
        })
        .await
    }

    async fn list_time_jobs(&self, filter: &JobFilter) -> Result<Vec<TimeJob>> {
        let status = filter.status.map(JobStatus::as_str);
        let function = filter.function.clone();
        let roots_only = filter.roots_only;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        self.with_conn(move |conn| {
            query_time_jobs(
                conn,
                &format!(
                    "SELECT {TIME_JOB_COLUMNS} FROM time_jobs \
                     WHERE (?1 IS NULL OR status = ?1) \
                       AND (?2 IS NULL OR function = ?2) \
                       AND (?3 = 0 OR parent_id IS NULL) \
                     ORDER BY created_at LIMIT ?4"
                ),
                params![status, function, roots_only, limit],
            )
        })
        .await
    }

    async fn find_due_time_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeJob>> {
        self.with_conn(move |conn| {
            query_time_jobs(
                conn,
                &format!(
                    "SELECT {TIME_JOB_COLUMNS} FROM time_jobs \
                     WHERE status = 'Idle' AND lock_holder IS NULL \
                       AND execution_time IS NOT NULL AND execution_time <= ?1 \
                     ORDER BY execution_time LIMIT ?2"
                ),
                params![ts(now), limit],
            )
        })
        .await
    }

    async fn arm_child(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    r"
                    UPDATE time_jobs SET execution_time = ?1, updated_at = ?2
                    WHERE id = ?3 AND status = 'Idle' AND execution_time IS NULL
                    ",
                    params![ts(at), ts(Utc::now()), id.to_string()],
                )
                .context("Failed to arm child")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn unresolved_parents(&self, limit: usize) -> Result<Vec<(Uuid, JobStatus)>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    r"
                    SELECT DISTINCT p.id, p.status FROM time_jobs c
                    JOIN time_jobs p ON p.id = c.parent_id
                    WHERE c.status = 'Idle' AND c.execution_time IS NULL
                      AND (p.status IN ('Done', 'DueDone', 'Failed', 'Cancelled', 'Skipped')
                           OR (p.status = 'InProgress' AND c.run_condition = 'InProgress'))
                    LIMIT ?1
                    ",
                )
                .context("Failed to prepare unresolved parent query")?;
            let rows = stmt
                .query_map(params![limit], |row| Ok((uuid_at(row, 0)?, status_at(row, 1)?)))
                .context("Failed to query unresolved parents")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read unresolved parent row")
        })
        .await
    }

    async fn insert_cron_definition(&self, definition: &CronDefinition) -> Result<()> {
        let definition = definition.clone();
        self.with_conn(move |conn| {
            let intervals = serde_json::to_string(&definition.retry_intervals)?;
            conn.execute(
                &format!(
                    "INSERT INTO cron_definitions ({DEFINITION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    definition.id.to_string(),
                    definition.function,
                    definition.expression,
                    definition.description,
                    definition.request,
                    definition.retries,
                    intervals,
                    ts(definition.created_at),
                    ts(definition.updated_at),
                ],
            )
            .context("Failed to insert cron definition")?;
            Ok(())
        })
        .await
    }

    async fn get_cron_definition(&self, id: Uuid) -> Result<Option<CronDefinition>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {DEFINITION_COLUMNS} FROM cron_definitions WHERE id = ?1"),
                params![id.to_string()],
                definition_from_row,
            )
            .optional()
            .context("Failed to load cron definition")
        })
        .await
    }

    async fn update_cron_definition(&self, definition: &CronDefinition) -> Result<bool> {
        let definition = definition.clone();
        self.with_conn(move |conn| {
            let intervals = serde_json::to_string(&definition.retry_intervals)?;
            let changed = conn
                .execute(
                    r"
                    UPDATE cron_definitions
                    SET function = ?1, expression = ?2, description = ?3, request = ?4,
                        retries = ?5, retry_intervals = ?6, updated_at = ?7
                    WHERE id = ?8
                    ",
                    params![
                        definition.function,
                        definition.expression,
                        definition.description,
                        definition.request,
                        definition.retries,
                        intervals,
                        ts(definition.updated_at),
                        definition.id.to_string(),
                    ],
                )
                .context("Failed to update cron definition")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_cron_definition(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            tx.execute(
                "DELETE FROM cron_occurrences WHERE cron_id = ?1",
                params![id.to_string()],
            )
            .context("Failed to delete occurrences")?;
            let removed = tx
                .execute(
                    "DELETE FROM cron_definitions WHERE id = ?1",
                    params![id.to_string()],
                )
                .context("Failed to delete cron definition")?;
            tx.commit().context("Failed to commit delete")?;
            Ok(removed == 1)
        })
        .await
    }

    async fn list_cron_definitions(&self) -> Result<Vec<CronDefinition>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {DEFINITION_COLUMNS} FROM cron_definitions ORDER BY created_at"
                ))
                .context("Failed to prepare definition query")?;
            let rows = stmt
                .query_map([], definition_from_row)
                .context("Failed to execute definition query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read cron definition row")
        })
        .await
    }

    async fn find_cron_by_seed(&self, function: &str, expression: &str) -> Result<Option<CronDefinition>> {
        let function = function.to_string();
        let expression = expression.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {DEFINITION_COLUMNS} FROM cron_definitions \
                     WHERE function = ?1 AND expression = ?2 \
                       AND (request IS NULL OR length(request) = 0) \
                     ORDER BY created_at LIMIT 1"
                ),
                params![function, expression],
                definition_from_row,
            )
            .optional()
            .context("Failed to look up seeded definition")
        })
        .await
    }

    async fn insert_occurrence(&self, occurrence: &CronOccurrence) -> Result<bool> {
        let o = occurrence.clone();
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    &format!(
                        "INSERT OR IGNORE INTO cron_occurrences ({OCCURRENCE_COLUMNS}) \
                         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13 \
                         WHERE NOT EXISTS (SELECT 1 FROM cron_occurrences \
                             WHERE cron_id = ?2 AND status IN ('Idle', 'Queued') AND executed_at IS NULL)"
                    ),
                    params![
                        o.id.to_string(),
                        o.cron_id.to_string(),
                        ts(o.execution_time),
                        o.state.status.as_str(),
                        o.state.executed_at.map(ts),
                        o.state.elapsed_ms,
                        o.state.retry_count,
                        o.state.lock_holder,
                        o.state.locked_at.map(ts),
                        o.state.exception,
                        o.state.skipped_reason,
                        ts(o.created_at),
                        ts(o.updated_at),
                    ],
                )
                .context("Failed to insert occurrence")?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<CronOccurrence>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {OCCURRENCE_COLUMNS} FROM cron_occurrences WHERE id = ?1"),
                params![id.to_string()],
                occurrence_from_row,
            )
            .optional()
            .context("Failed to load occurrence")
        })
        .await
    }

    async fn occurrences(&self, cron_id: Uuid) -> Result<Vec<CronOccurrence>> {
        self.with_conn(move |conn| {
            query_occurrences(
                conn,
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM cron_occurrences \
                     WHERE cron_id = ?1 ORDER BY execution_time"
                ),
                params![cron_id.to_string()],
            )
        })
        .await
    }

    async fn pending_occurrence(&self, cron_id: Uuid) -> Result<Option<CronOccurrence>> {
        self.with_conn(move |conn| {
            let mut found = query_occurrences(
                conn,
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM cron_occurrences \
                     WHERE cron_id = ?1 AND status IN ('Idle', 'Queued') AND executed_at IS NULL \
                     ORDER BY execution_time LIMIT 1"
                ),
                params![cron_id.to_string()],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn latest_occurrence(&self, cron_id: Uuid) -> Result<Option<CronOccurrence>> {
        self.with_conn(move |conn| {
            let mut found = query_occurrences(
                conn,
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM cron_occurrences \
                     WHERE cron_id = ?1 ORDER BY execution_time DESC LIMIT 1"
                ),
                params![cron_id.to_string()],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn delete_idle_occurrence(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM cron_occurrences WHERE id = ?1 AND status = 'Idle' AND lock_holder IS NULL",
                    params![id.to_string()],
                )
                .context("Failed to delete occurrence")?;
            Ok(removed == 1)
        })
        .await
    }

    async fn find_due_occurrences(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CronOccurrence>> {
        self.with_conn(move |conn| {
            query_occurrences(
                conn,
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM cron_occurrences \
                     WHERE status = 'Idle' AND lock_holder IS NULL AND execution_time <= ?1 \
                     ORDER BY execution_time LIMIT ?2"
                ),
                params![ts(now), limit],
            )
        })
        .await
    }

    async fn count_in_progress_occurrences(&self, cron_id: Uuid, exclude: Option<Uuid>) -> Result<u64> {
        self.with_conn(move |conn| {
            conn.query_row(
                r"
                SELECT COUNT(*) FROM cron_occurrences
                WHERE cron_id = ?1 AND status = 'InProgress' AND (?2 IS NULL OR id != ?2)
                ",
                params![cron_id.to_string(), exclude.map(|id| id.to_string())],
                |row| row.get(0),
            )
            .context("Failed to count running occurrences")
        })
        .await
    }

    async fn try_claim(
        &self,
        kind: JobKind,
        id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let node_id = node_id.to_string();
        let table = Self::table(kind);
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table} SET status = 'Queued', lock_holder = ?1, locked_at = ?2, updated_at = ?2 \
                         WHERE id = ?3 AND status = 'Idle' AND lock_holder IS NULL"
                    ),
                    params![node_id, ts(now), id.to_string()],
                )
                .context("Failed to claim")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn transition(&self, kind: JobKind, id: Uuid, transition: &Transition) -> Result<bool> {
        if !transition.from.can_transition_to(transition.to) {
            return Ok(false);
        }
        let t = transition.clone();
        let table = Self::table(kind);
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table} SET \
                             status = ?1, \
                             updated_at = ?2, \
                             executed_at = COALESCE(?3, executed_at), \
                             elapsed_ms = COALESCE(?4, elapsed_ms), \
                             retry_count = COALESCE(?5, retry_count), \
                             exception = COALESCE(?6, exception), \
                             skipped_reason = COALESCE(?7, skipped_reason), \
                             execution_time = COALESCE(?8, execution_time), \
                             lock_holder = CASE WHEN ?9 THEN NULL ELSE lock_holder END, \
                             locked_at = CASE WHEN ?9 THEN NULL ELSE locked_at END \
                         WHERE id = ?10 AND status = ?11 AND (?12 IS NULL OR lock_holder = ?12)"
                    ),
                    params![
                        t.to.as_str(),
                        ts(Utc::now()),
                        t.executed_at.map(ts),
                        t.elapsed_ms,
                        t.retry_count,
                        t.exception,
                        t.skipped_reason,
                        t.execution_time.map(ts),
                        t.release_lock,
                        id.to_string(),
                        t.from.as_str(),
                        t.owner,
                    ],
                )
                .context("Failed to apply transition")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn next_due_time(&self) -> Result<Option<DateTime<Utc>>> {
        let micros: Option<i64> = self
            .with_conn(|conn| {
                conn.query_row(
                    r"
                    SELECT MIN(t) FROM (
                        SELECT MIN(execution_time) AS t FROM time_jobs
                        WHERE status = 'Idle' AND lock_holder IS NULL AND execution_time IS NOT NULL
                        UNION ALL
                        SELECT MIN(execution_time) AS t FROM cron_occurrences
                        WHERE status = 'Idle' AND lock_holder IS NULL
                    )
                    ",
                    [],
                    |row| row.get(0),
                )
                .context("Failed to query next due time")
            })
            .await?;
        Ok(micros.and_then(DateTime::from_timestamp_micros))
    }

    async fn lock_holders(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r"
                    SELECT lock_holder FROM time_jobs WHERE lock_holder IS NOT NULL
                    UNION
                    SELECT lock_holder FROM cron_occurrences WHERE lock_holder IS NOT NULL
                    ORDER BY 1
                    ",
                )
                .context("Failed to prepare lock holder query")?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .context("Failed to execute lock holder query")?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
                .context("Failed to read lock holder")
        })
        .await
    }

    async fn release_locks(&self, node_ids: &[String]) -> Result<ReleaseSummary> {
        let node_ids = node_ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let now = ts(Utc::now());
            let mut summary = ReleaseSummary::default();
            for node_id in &node_ids {
                for (kind, counter) in [
                    (JobKind::Time, &mut summary.time_jobs),
                    (JobKind::Cron, &mut summary.occurrences),
                ] {
                    let table = Self::table(kind);
                    *counter += tx
                        .execute(
                            &format!(
                                "UPDATE {table} SET \
                                     status = CASE WHEN status IN ('Queued', 'InProgress') THEN 'Idle' ELSE status END, \
                                     lock_holder = NULL, locked_at = NULL, updated_at = ?1 \
                                 WHERE lock_holder = ?2"
                            ),
                            params![now, node_id],
                        )
                        .context("Failed to release locks")? as u64;
                }
            }
            tx.commit().context("Failed to commit lock release")?;
            Ok(summary)
        })
        .await
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let jobs = tx
                .execute(
                    &format!(
                        "DELETE FROM time_jobs WHERE status IN {TERMINAL} AND updated_at < ?1 \
                         AND NOT EXISTS (SELECT 1 FROM time_jobs c \
                                         WHERE c.parent_id = time_jobs.id AND c.status NOT IN {TERMINAL})"
                    ),
                    params![ts(before)],
                )
                .context("Failed to purge time jobs")?;
            let occurrences = tx
                .execute(
                    &format!(
                        "DELETE FROM cron_occurrences WHERE status IN {TERMINAL} AND updated_at < ?1"
                    ),
                    params![ts(before)],
                )
                .context("Failed to purge occurrences")?;
            tx.commit().context("Failed to commit purge")?;
            Ok((jobs + occurrences) as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewCronJob, NewTimeJob};
    use chrono::{SubsecRound, TimeDelta};
    use tempfile::NamedTempFile;

    async fn file_store() -> (SqliteStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(file.path()).await.unwrap();
        (store, file)
    }

    #[tokio::test]
    async fn test_time_job_tree_round_trip() {
        let (store, _file) = file_store().await;
        let now = Utc::now().trunc_subsecs(6);
        let records = NewTimeJob::new("parent")
            .at(now)
            .retries(2, vec![1, 2])
            .child(NewTimeJob::new("child").run_condition(RunCondition::OnFailure))
            .into_records(now);
        store.insert_time_jobs(&records).await.unwrap();

        let parent = store.get_time_job(records[0].id).await.unwrap().unwrap();
        assert_eq!(parent, records[0]);

        let children = store.children(parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].run_condition, Some(RunCondition::OnFailure));
        assert_eq!(children[0].execution_time, None);

        let roots = store.list_time_jobs(&JobFilter::default().roots_only()).await.unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let (store, _file) = file_store().await;
        let now = Utc::now();
        let job = NewTimeJob::new("work").at(now).into_records(now).remove(0);
        store.insert_time_jobs(&[job.clone()]).await.unwrap();

        let (a, b) = tokio::join!(
            store.try_claim(JobKind::Time, job.id, "node-a", now),
            store.try_claim(JobKind::Time, job.id, "node-b", now),
        );
        assert!(a.unwrap() ^ b.unwrap());

        let stored = store.get_time_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Queued);
        let holder = stored.state.lock_holder.unwrap();

        let wrong_owner = Transition::new(JobStatus::Queued, JobStatus::InProgress).owned_by("node-c");
        assert!(!store.transition(JobKind::Time, job.id, &wrong_owner).await.unwrap());
        let start = Transition::new(JobStatus::Queued, JobStatus::InProgress).owned_by(holder);
        assert!(store.transition(JobKind::Time, job.id, &start).await.unwrap());
        let done = Transition::new(JobStatus::InProgress, JobStatus::DueDone).elapsed_ms(5);
        assert!(store.transition(JobKind::Time, job.id, &done).await.unwrap());

        let stored = store.get_time_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::DueDone);
        assert_eq!(stored.state.lock_holder, None);
        assert_eq!(stored.state.elapsed_ms, Some(5));
    }

    #[tokio::test]
    async fn test_unresolved_parents() {
        let (store, _file) = file_store().await;
        let now = Utc::now();
        let records = NewTimeJob::new("parent")
            .at(now)
            .child(NewTimeJob::new("watch").run_condition(RunCondition::InProgress))
            .child(NewTimeJob::new("after").run_condition(RunCondition::OnSuccess))
            .into_records(now);
        store.insert_time_jobs(&records).await.unwrap();
        let parent = records[0].id;
        assert!(store.unresolved_parents(10).await.unwrap().is_empty());

        store.try_claim(JobKind::Time, parent, "a", now).await.unwrap();
        let start = Transition::new(JobStatus::Queued, JobStatus::InProgress).executed_at(now);
        store.transition(JobKind::Time, parent, &start).await.unwrap();
        assert_eq!(store.unresolved_parents(10).await.unwrap(), vec![(parent, JobStatus::InProgress)]);

        assert!(store.arm_child(records[1].id, now).await.unwrap());
        assert!(store.unresolved_parents(10).await.unwrap().is_empty());

        let done = Transition::new(JobStatus::InProgress, JobStatus::Done);
        store.transition(JobKind::Time, parent, &done).await.unwrap();
        assert_eq!(store.unresolved_parents(10).await.unwrap(), vec![(parent, JobStatus::Done)]);
    }

    #[tokio::test]
    async fn test_occurrence_uniqueness_and_release() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let now = Utc::now().trunc_subsecs(0);
        let definition = NewCronJob::new("tick", "*/10 * * * * *").into_definition(now);
        store.insert_cron_definition(&definition).await.unwrap();

        let occurrence = CronOccurrence::new(definition.id, now, now);
        assert!(store.insert_occurrence(&occurrence).await.unwrap());
        assert!(!store
            .insert_occurrence(&CronOccurrence::new(definition.id, now, now))
            .await
            .unwrap());
        // A node that computed a later slot from a stale read is refused too.
        let later = CronOccurrence::new(definition.id, now + TimeDelta::seconds(10), now);
        assert!(!store.insert_occurrence(&later).await.unwrap());
        assert_eq!(store.occurrences(definition.id).await.unwrap().len(), 1);

        assert!(store.try_claim(JobKind::Cron, occurrence.id, "dead", now).await.unwrap());
        assert_eq!(store.lock_holders().await.unwrap(), vec!["dead".to_string()]);
        let summary = store.release_locks(&["dead".to_string()]).await.unwrap();
        assert_eq!(summary, ReleaseSummary { time_jobs: 0, occurrences: 1 });

        let released = store.get_occurrence(occurrence.id).await.unwrap().unwrap();
        assert_eq!(released.status(), JobStatus::Idle);
        assert_eq!(released.state.lock_holder, None);
        assert_eq!(store.next_due_time().await.unwrap(), Some(now));

        // Once the first occurrence has started, the next slot is accepted.
        store.try_claim(JobKind::Cron, occurrence.id, "alive", now).await.unwrap();
        let start = Transition::new(JobStatus::Queued, JobStatus::InProgress).executed_at(now);
        assert!(store.transition(JobKind::Cron, occurrence.id, &start).await.unwrap());
        assert!(store.insert_occurrence(&later).await.unwrap());
    }

    #[tokio::test]
    async fn test_seed_lookup_and_purge() {
        let (store, _file) = file_store().await;
        let now = Utc::now();
        let definition = NewCronJob::new("cleanup", "0 0 * * * *").into_definition(now);
        store.insert_cron_definition(&definition).await.unwrap();
        assert!(store.find_cron_by_seed("cleanup", "0 0 * * * *").await.unwrap().is_some());
        assert!(store.find_cron_by_seed("cleanup", "0 5 * * * *").await.unwrap().is_none());

        let job = NewTimeJob::new("work").at(now).into_records(now).remove(0);
        store.insert_time_jobs(&[job.clone()]).await.unwrap();
        store.try_claim(JobKind::Time, job.id, "a", now).await.unwrap();
        let cancel = Transition::new(JobStatus::Queued, JobStatus::Cancelled);
        assert!(store.transition(JobKind::Time, job.id, &cancel).await.unwrap());

        assert_eq!(store.purge_terminal(now - TimeDelta::hours(1)).await.unwrap(), 0);
        assert_eq!(store.purge_terminal(Utc::now() + TimeDelta::seconds(1)).await.unwrap(), 1);
    }
}
