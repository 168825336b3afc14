//! SQLite-backed work store implementation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use crate::lifecycle::{ChildTally, SubmissionStatus, WorkStatus};

use super::store::{
    BatchFilter, JobFilter, NewBatch, NewJob, NewSubmission, StoreError, SubmissionFilter,
    SubmissionUpdate, WorkStore,
};
use super::types::{Batch, Job, Progress, Submission, SubmissionError, DEFAULT_PRIORITY};

/// Job scheduling priority (the higher of the override and the batch
/// priority, else the bound default) compared against a bound parameter.
/// Scalar `MAX` yields NULL when either side is NULL.
const JOB_SCHEDULING_PRIORITY_AT_LEAST: &str = "? <= COALESCE(\
    MAX(priority, (SELECT b.priority FROM batches b WHERE b.id = jobs.batch_id)), \
    priority, (SELECT b.priority FROM batches b WHERE b.id = jobs.batch_id), ?)";
const JOB_SCHEDULING_PRIORITY_AT_MOST: &str = "? >= COALESCE(\
    MAX(priority, (SELECT b.priority FROM batches b WHERE b.id = jobs.batch_id)), \
    priority, (SELECT b.priority FROM batches b WHERE b.id = jobs.batch_id), ?)";

const BATCH_COLUMNS: &str = "id, name, status, priority, tags, owner, deadline, total_jobs, \
    completed_jobs, failed_jobs, created_at, updated_at, started_at, completed_at";

const JOB_COLUMNS: &str = "id, batch_id, name, status, priority, provider, retry_policy, \
    total_submissions, completed_submissions, failed_submissions, created_at, updated_at, \
    started_at, completed_at";

const SUBMISSION_COLUMNS: &str = "id, job_id, status, attempt_count, payload, output, \
    last_error, enqueued_at, ready_at, started_at, completed_at, updated_at";

/// SQLite-backed work store.
pub struct SqliteWorkStore {
    conn: Mutex<Connection>,
}

/// Timestamps are stored with fixed precision so they sort lexicographically.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn get_work_status(row: &Row, idx: usize) -> rusqlite::Result<WorkStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

fn get_submission_status(row: &Row, idx: usize) -> rusqlite::Result<SubmissionStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

fn row_to_batch(row: &Row) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: row.get(0)?,
        name: row.get(1)?,
        status: get_work_status(row, 2)?,
        priority: row.get(3)?,
        tags: get_json(row, 4)?,
        owner: row.get(5)?,
        deadline: get_opt_ts(row, 6)?,
        total_jobs: row.get(7)?,
        completed_jobs: row.get(8)?,
        failed_jobs: row.get(9)?,
        created_at: get_ts(row, 10)?,
        updated_at: get_ts(row, 11)?,
        started_at: get_opt_ts(row, 12)?,
        completed_at: get_opt_ts(row, 13)?,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        name: row.get(2)?,
        status: get_work_status(row, 3)?,
        priority: row.get(4)?,
        provider: row.get(5)?,
        retry_policy: get_json(row, 6)?,
        total_submissions: row.get(7)?,
        completed_submissions: row.get(8)?,
        failed_submissions: row.get(9)?,
        created_at: get_ts(row, 10)?,
        updated_at: get_ts(row, 11)?,
        started_at: get_opt_ts(row, 12)?,
        completed_at: get_opt_ts(row, 13)?,
    })
}

fn row_to_submission(row: &Row) -> rusqlite::Result<Submission> {
    let last_error: Option<String> = row.get(6)?;
    let last_error = last_error
        .map(|raw| serde_json::from_str::<SubmissionError>(&raw))
        .transpose()
        .map_err(|e| conversion_error(6, e))?;

    Ok(Submission {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: get_submission_status(row, 2)?,
        attempt_count: row.get(3)?,
        payload: get_json(row, 4)?,
        output: row.get(5)?,
        last_error,
        enqueued_at: get_ts(row, 7)?,
        ready_at: get_ts(row, 8)?,
        started_at: get_opt_ts(row, 9)?,
        completed_at: get_opt_ts(row, 10)?,
        updated_at: get_ts(row, 11)?,
    })
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: &[Box<dyn ToSql>],
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), map)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

fn count_all(conn: &Connection, sql: &str, params: &[Box<dyn ToSql>]) -> Result<i64, StoreError> {
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    Ok(conn.query_row(sql, param_refs.as_slice(), |row| row.get(0))?)
}

fn join_conditions(conditions: &[&str]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

impl SqliteWorkStore {
    /// Create a new SQLite work store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite work store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        // In-memory databases answer "memory"; only file databases switch to WAL.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "Opened work store");

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                owner TEXT,
                deadline TEXT,
                total_jobs INTEGER NOT NULL DEFAULT 0,
                completed_jobs INTEGER NOT NULL DEFAULT 0,
                failed_jobs INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);
            CREATE INDEX IF NOT EXISTS idx_batches_priority ON batches(priority DESC);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                batch_id TEXT REFERENCES batches(id),
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER,
                provider TEXT NOT NULL,
                retry_policy TEXT NOT NULL,
                total_submissions INTEGER NOT NULL DEFAULT 0,
                completed_submissions INTEGER NOT NULL DEFAULT 0,
                failed_submissions INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs(batch_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                output TEXT,
                last_error TEXT,
                enqueued_at TEXT NOT NULL,
                ready_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_submissions_job_status ON submissions(job_id, status);
            CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    fn fetch_batch(conn: &Connection, id: &str) -> Result<Option<Batch>, StoreError> {
        let sql = format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_batch).optional()?)
    }

    fn fetch_job(conn: &Connection, id: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_job).optional()?)
    }

    fn fetch_submission(conn: &Connection, id: &str) -> Result<Option<Submission>, StoreError> {
        let sql = format!("SELECT {} FROM submissions WHERE id = ?", SUBMISSION_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_submission).optional()?)
    }

    /// Explain a compare-and-set that touched no rows.
    fn lost_update(
        conn: &Connection,
        table: &str,
        kind: &'static str,
        id: &str,
        expected: &str,
    ) -> StoreError {
        let sql = format!("SELECT status FROM {} WHERE id = ?", table);
        match conn
            .query_row(&sql, params![id], |row| row.get::<_, String>(0))
            .optional()
        {
            Ok(Some(actual)) => StoreError::Conflict {
                kind,
                id: id.to_string(),
                expected: expected.to_string(),
                actual,
            },
            Ok(None) => StoreError::NotFound {
                kind,
                id: id.to_string(),
            },
            Err(e) => e.into(),
        }
    }

    /// Shared status compare-and-set for batches and jobs.
    fn cas_work_status(
        conn: &Connection,
        table: &str,
        id: &str,
        from: WorkStatus,
        to: WorkStatus,
    ) -> Result<usize, StoreError> {
        let now = ts(&Utc::now());
        let reopening = to == WorkStatus::Processing;
        let closing = to.is_terminal() && to != WorkStatus::Archived;

        let sql = format!(
            "UPDATE {} SET status = ?1, updated_at = ?2, \
                started_at = CASE WHEN ?3 THEN COALESCE(started_at, ?2) ELSE started_at END, \
                completed_at = CASE WHEN ?4 THEN ?2 WHEN ?3 THEN NULL ELSE completed_at END \
             WHERE id = ?5 AND status = ?6",
            table
        );
        Ok(conn.execute(
            &sql,
            params![to.as_str(), now, reopening, closing, id, from.as_str()],
        )?)
    }

    fn batch_where_clause(filter: &BatchFilter) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(min) = filter.min_priority {
            conditions.push("priority >= ?");
            params.push(Box::new(min));
        }

        if let Some(max) = filter.max_priority {
            conditions.push("priority <= ?");
            params.push(Box::new(max));
        }

        if let Some(ref tag) = filter.tag {
            conditions.push("EXISTS (SELECT 1 FROM json_each(batches.tags) WHERE json_each.value = ?)");
            params.push(Box::new(tag.clone()));
        }

        if let Some(ref owner) = filter.owner {
            conditions.push("owner = ?");
            params.push(Box::new(owner.clone()));
        }

        (join_conditions(&conditions), params)
    }

    fn job_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref batch_id) = filter.batch_id {
            conditions.push("batch_id = ?");
            params.push(Box::new(batch_id.clone()));
        }

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref provider) = filter.provider {
            conditions.push("provider = ?");
            params.push(Box::new(provider.clone()));
        }

        // Same rule as Job::scheduling_priority
        if let Some(min) = filter.min_priority {
            conditions.push(JOB_SCHEDULING_PRIORITY_AT_LEAST);
            params.push(Box::new(min));
            params.push(Box::new(DEFAULT_PRIORITY));
        }

        if let Some(max) = filter.max_priority {
            conditions.push(JOB_SCHEDULING_PRIORITY_AT_MOST);
            params.push(Box::new(max));
            params.push(Box::new(DEFAULT_PRIORITY));
        }

        (join_conditions(&conditions), params)
    }

    fn submission_where_clause(filter: &SubmissionFilter) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref job_id) = filter.job_id {
            conditions.push("job_id = ?");
            params.push(Box::new(job_id.clone()));
        }

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        (join_conditions(&conditions), params)
    }
}

impl WorkStore for SqliteWorkStore {
    fn create_batch(&self, batch: NewBatch) -> Result<Batch, StoreError> {
        let conn = self.conn()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let tags_json = serde_json::to_string(&batch.tags)?;

        conn.execute(
            "INSERT INTO batches (id, name, status, priority, tags, owner, deadline, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                batch.name,
                WorkStatus::Draft.as_str(),
                batch.priority,
                tags_json,
                batch.owner,
                batch.deadline.as_ref().map(ts),
                ts(&now),
                ts(&now),
            ],
        )?;

        Ok(Batch {
            id,
            name: batch.name,
            status: WorkStatus::Draft,
            priority: batch.priority,
            tags: batch.tags,
            owner: batch.owner,
            deadline: batch.deadline,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_batch(&conn, id)
    }

    fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<Batch>, StoreError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::batch_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM batches {} ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ? OFFSET ?",
            BATCH_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        query_all(&conn, &sql, &params, row_to_batch)
    }

    fn count_batches(&self, filter: &BatchFilter) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::batch_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM batches {}", where_clause);
        count_all(&conn, &sql, &params)
    }

    fn transition_batch(
        &self,
        id: &str,
        from: WorkStatus,
        to: WorkStatus,
    ) -> Result<Batch, StoreError> {
        let conn = self.conn()?;
        if Self::cas_work_status(&conn, "batches", id, from, to)? == 0 {
            return Err(Self::lost_update(&conn, "batches", "batch", id, from.as_str()));
        }
        Self::fetch_batch(&conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "batch",
            id: id.to_string(),
        })
    }

    fn set_batch_progress(&self, id: &str, progress: Progress) -> Result<Batch, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE batches SET total_jobs = ?, completed_jobs = ?, failed_jobs = ?, updated_at = ? WHERE id = ?",
            params![
                progress.total,
                progress.completed,
                progress.failed,
                ts(&Utc::now()),
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "batch",
                id: id.to_string(),
            });
        }
        Self::fetch_batch(&conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "batch",
            id: id.to_string(),
        })
    }

    fn job_tally(&self, batch_id: &str) -> Result<ChildTally, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM jobs WHERE batch_id = ? GROUP BY status")?;
        let rows = stmt.query_map(params![batch_id], |row| {
            Ok((get_work_status(row, 0)?, row.get::<_, u32>(1)?))
        })?;

        let mut tally = ChildTally::default();
        for row in rows {
            let (status, count) = row?;
            tally.total += count;
            match status {
                WorkStatus::Completed => tally.completed += count,
                WorkStatus::CompletedWithErrors => {
                    tally.completed += count;
                    tally.degraded += count;
                }
                WorkStatus::Failed => tally.failed += count,
                WorkStatus::Cancelled => tally.cancelled += count,
                _ => tally.open += count,
            }
        }
        Ok(tally)
    }

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let conn = self.conn()?;

        if let Some(ref batch_id) = job.batch_id {
            if Self::fetch_batch(&conn, batch_id)?.is_none() {
                return Err(StoreError::NotFound {
                    kind: "batch",
                    id: batch_id.clone(),
                });
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let policy_json = serde_json::to_string(&job.retry_policy)?;

        conn.execute(
            "INSERT INTO jobs (id, batch_id, name, status, priority, provider, retry_policy, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                job.batch_id,
                job.name,
                WorkStatus::Draft.as_str(),
                job.priority,
                job.provider,
                policy_json,
                ts(&now),
                ts(&now),
            ],
        )?;

        Ok(Job {
            id,
            batch_id: job.batch_id,
            name: job.name,
            status: WorkStatus::Draft,
            priority: job.priority,
            provider: job.provider,
            retry_policy: job.retry_policy,
            total_submissions: 0,
            completed_submissions: 0,
            failed_submissions: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_job(&conn, id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::job_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        query_all(&conn, &sql, &params, row_to_job)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::job_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        count_all(&conn, &sql, &params)
    }

    fn transition_job(&self, id: &str, from: WorkStatus, to: WorkStatus) -> Result<Job, StoreError> {
        let conn = self.conn()?;
        if Self::cas_work_status(&conn, "jobs", id, from, to)? == 0 {
            return Err(Self::lost_update(&conn, "jobs", "job", id, from.as_str()));
        }
        Self::fetch_job(&conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "job",
            id: id.to_string(),
        })
    }

    fn set_job_progress(&self, id: &str, progress: Progress) -> Result<Job, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET total_submissions = ?, completed_submissions = ?, failed_submissions = ?, updated_at = ? WHERE id = ?",
            params![
                progress.total,
                progress.completed,
                progress.failed,
                ts(&Utc::now()),
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "job",
                id: id.to_string(),
            });
        }
        Self::fetch_job(&conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "job",
            id: id.to_string(),
        })
    }

    fn submission_tally(&self, job_id: &str) -> Result<ChildTally, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM submissions WHERE job_id = ? GROUP BY status")?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((get_submission_status(row, 0)?, row.get::<_, u32>(1)?))
        })?;

        let mut tally = ChildTally::default();
        for row in rows {
            let (status, count) = row?;
            tally.total += count;
            match status {
                SubmissionStatus::Completed => tally.completed += count,
                SubmissionStatus::Failed => tally.failed += count,
                SubmissionStatus::Cancelled => tally.cancelled += count,
                SubmissionStatus::Queued | SubmissionStatus::InProgress => tally.open += count,
            }
        }
        Ok(tally)
    }

    fn add_submission(&self, submission: NewSubmission) -> Result<Submission, StoreError> {
        let conn = self.conn()?;

        if Self::fetch_job(&conn, &submission.job_id)?.is_none() {
            return Err(StoreError::NotFound {
                kind: "job",
                id: submission.job_id,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let payload_json = serde_json::to_string(&submission.payload)?;

        conn.execute(
            "INSERT INTO submissions (id, job_id, status, attempt_count, payload, enqueued_at, ready_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?)",
            params![
                id,
                submission.job_id,
                SubmissionStatus::Queued.as_str(),
                payload_json,
                ts(&now),
                ts(&now),
                ts(&now),
            ],
        )?;

        Ok(Submission {
            id,
            job_id: submission.job_id,
            status: SubmissionStatus::Queued,
            attempt_count: 0,
            payload: submission.payload,
            output: None,
            last_error: None,
            enqueued_at: now,
            ready_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_submission(&conn, id)
    }

    fn list_submissions(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>, StoreError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::submission_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM submissions {} ORDER BY enqueued_at ASC, rowid ASC LIMIT ? OFFSET ?",
            SUBMISSION_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        query_all(&conn, &sql, &params, row_to_submission)
    }

    fn count_submissions(&self, filter: &SubmissionFilter) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::submission_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM submissions {}", where_clause);
        count_all(&conn, &sql, &params)
    }

    fn transition_submission(
        &self,
        id: &str,
        from: SubmissionStatus,
        update: SubmissionUpdate,
    ) -> Result<Submission, StoreError> {
        let to = from.transition(update.target())?;
        let conn = self.conn()?;
        let now = ts(&Utc::now());

        let changed = match &update {
            SubmissionUpdate::Claim => conn.execute(
                "UPDATE submissions SET status = ?1, started_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?,
            SubmissionUpdate::Complete { output } => conn.execute(
                "UPDATE submissions SET status = ?1, output = ?2, completed_at = ?3, updated_at = ?3 \
                 WHERE id = ?4 AND status = ?5",
                params![to.as_str(), output, now, id, from.as_str()],
            )?,
            SubmissionUpdate::Fail { error } => conn.execute(
                "UPDATE submissions SET status = ?1, last_error = ?2, completed_at = ?3, updated_at = ?3 \
                 WHERE id = ?4 AND status = ?5",
                params![to.as_str(), serde_json::to_string(error)?, now, id, from.as_str()],
            )?,
            SubmissionUpdate::Requeue { ready_at, error } => conn.execute(
                "UPDATE submissions SET status = ?1, attempt_count = attempt_count + 1, \
                    last_error = ?2, ready_at = ?3, started_at = NULL, updated_at = ?4 \
                 WHERE id = ?5 AND status = ?6",
                params![
                    to.as_str(),
                    serde_json::to_string(error)?,
                    ts(ready_at),
                    now,
                    id,
                    from.as_str()
                ],
            )?,
            SubmissionUpdate::Cancel => conn.execute(
                "UPDATE submissions SET status = ?1, completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?,
            SubmissionUpdate::Reset => conn.execute(
                "UPDATE submissions SET status = ?1, ready_at = ?2, started_at = NULL, \
                    completed_at = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?,
        };

        if changed == 0 {
            return Err(Self::lost_update(
                &conn,
                "submissions",
                "submission",
                id,
                from.as_str(),
            ));
        }

        Self::fetch_submission(&conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "submission",
            id: id.to_string(),
        })
    }

    fn cancel_open_submissions(&self, job_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        let now = ts(&Utc::now());
        let changed = conn.execute(
            "UPDATE submissions SET status = ?1, completed_at = ?2, updated_at = ?2 \
             WHERE job_id = ?3 AND status IN (?4, ?5)",
            params![
                SubmissionStatus::Cancelled.as_str(),
                now,
                job_id,
                SubmissionStatus::Queued.as_str(),
                SubmissionStatus::InProgress.as_str(),
            ],
        )?;
        Ok(changed as u32)
    }

    fn reset_failed_submissions(&self, job_id: &str) -> Result<Vec<Submission>, StoreError> {
        let conn = self.conn()?;

        let failed: Vec<Box<dyn ToSql>> = vec![
            Box::new(job_id.to_string()),
            Box::new(SubmissionStatus::Failed.as_str()),
        ];
        let ids = query_all(
            &conn,
            "SELECT id FROM submissions WHERE job_id = ? AND status = ? ORDER BY enqueued_at ASC, rowid ASC",
            &failed,
            |row| row.get::<_, String>(0),
        )?;

        let now = ts(&Utc::now());
        conn.execute(
            "UPDATE submissions SET status = ?1, ready_at = ?2, started_at = NULL, \
                completed_at = NULL, updated_at = ?2 \
             WHERE job_id = ?3 AND status = ?4",
            params![
                SubmissionStatus::Queued.as_str(),
                now,
                job_id,
                SubmissionStatus::Failed.as_str(),
            ],
        )?;

        let mut reset = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(submission) = Self::fetch_submission(&conn, &id)? {
                reset.push(submission);
            }
        }
        Ok(reset)
    }

    fn release_in_progress(&self, keep: &HashSet<String>) -> Result<u32, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let orphaned: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM submissions WHERE status = ?1")?;
            let ids = stmt.query_map(params![SubmissionStatus::InProgress.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            ids.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .filter(|id| !keep.contains(id))
                .collect()
        };

        let now = ts(&Utc::now());
        let mut released = 0;
        for id in &orphaned {
            released += tx.execute(
                "UPDATE submissions SET status = ?1, started_at = NULL, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    SubmissionStatus::Queued.as_str(),
                    now,
                    id,
                    SubmissionStatus::InProgress.as_str(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(released as u32)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::executor::ErrorKind;
    use crate::retry::RetryPolicy;

    fn create_test_store() -> SqliteWorkStore {
        SqliteWorkStore::in_memory().unwrap()
    }

    fn new_batch(name: &str, priority: u8, tags: &[&str]) -> NewBatch {
        NewBatch {
            name: name.to_string(),
            priority,
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            owner: Some("instructor-1".to_string()),
            deadline: None,
        }
    }

    fn new_job(batch_id: Option<&str>) -> NewJob {
        NewJob {
            batch_id: batch_id.map(str::to_string),
            name: "essays".to_string(),
            priority: None,
            provider: "openai".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    fn transient(message: &str) -> SubmissionError {
        SubmissionError {
            kind: ErrorKind::Transient,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_create_and_get_batch() {
        let store = create_test_store();
        let created = store
            .create_batch(new_batch("Midterm", 7, &["math", "fall"]))
            .unwrap();

        assert_eq!(created.status, WorkStatus::Draft);
        let fetched = store.get_batch(&created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Midterm");
        assert_eq!(fetched.priority, 7);
        assert!(fetched.tags.contains("math"));
        assert_eq!(fetched.owner.as_deref(), Some("instructor-1"));
        assert!(store.get_batch("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_batches_filters() {
        let store = create_test_store();
        store.create_batch(new_batch("a", 2, &["math"])).unwrap();
        store.create_batch(new_batch("b", 8, &["science"])).unwrap();
        store.create_batch(new_batch("c", 5, &["math", "science"])).unwrap();

        let all = store.list_batches(&BatchFilter::new()).unwrap();
        let names: Vec<_> = all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);

        let math = store
            .list_batches(&BatchFilter::new().with_tag("math"))
            .unwrap();
        assert_eq!(math.len(), 2);

        let high = BatchFilter::new().with_priority_range(Some(5), None);
        assert_eq!(store.count_batches(&high).unwrap(), 2);

        let page = store
            .list_batches(&BatchFilter::new().with_limit(1).with_offset(1))
            .unwrap();
        assert_eq!(page[0].name, "c");
    }

    #[test]
    fn test_list_jobs_by_scheduling_priority() {
        let store = create_test_store();
        let batch = store.create_batch(new_batch("a", 7, &[])).unwrap();

        let inherits = store.create_job(new_job(Some(&batch.id))).unwrap();
        let boosted = store
            .create_job(NewJob {
                priority: Some(9),
                ..new_job(Some(&batch.id))
            })
            .unwrap();
        let standalone = store.create_job(new_job(None)).unwrap();
        store
            .create_job(NewJob {
                priority: Some(2),
                ..new_job(None)
            })
            .unwrap();

        let ids = |filter: JobFilter| -> Vec<String> {
            store
                .list_jobs(&filter)
                .unwrap()
                .into_iter()
                .map(|j| j.id)
                .collect()
        };

        assert_eq!(
            ids(JobFilter::new().with_priority_range(Some(7), None)),
            vec![inherits.id.clone(), boosted.id.clone()]
        );
        assert_eq!(
            ids(JobFilter::new().with_priority_range(Some(5), Some(5))),
            vec![standalone.id.clone()]
        );
        assert_eq!(
            store
                .count_jobs(&JobFilter::new().with_priority_range(None, Some(7)))
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_transition_batch_compare_and_set() {
        let store = create_test_store();
        let batch = store.create_batch(new_batch("a", 5, &[])).unwrap();

        let batch = store
            .transition_batch(&batch.id, WorkStatus::Draft, WorkStatus::Pending)
            .unwrap();
        assert_eq!(batch.status, WorkStatus::Pending);

        let err = store
            .transition_batch(&batch.id, WorkStatus::Draft, WorkStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref actual, .. } if actual == "pending"));

        let err = store
            .transition_batch("missing", WorkStatus::Draft, WorkStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "batch", .. }));
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let store = create_test_store();
        let job = store.create_job(new_job(None)).unwrap();

        store
            .transition_job(&job.id, WorkStatus::Draft, WorkStatus::Pending)
            .unwrap();
        let job = store
            .transition_job(&job.id, WorkStatus::Pending, WorkStatus::Processing)
            .unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        let job = store
            .transition_job(&job.id, WorkStatus::Processing, WorkStatus::Failed)
            .unwrap();
        assert!(job.completed_at.is_some());

        let reopened = store
            .transition_job(&job.id, WorkStatus::Failed, WorkStatus::Processing)
            .unwrap();
        assert!(reopened.completed_at.is_none());
        assert_eq!(reopened.started_at, job.started_at);
    }

    #[test]
    fn test_create_job_requires_batch() {
        let store = create_test_store();
        let err = store.create_job(new_job(Some("missing"))).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "batch", .. }));
    }

    #[test]
    fn test_submission_lifecycle() {
        let store = create_test_store();
        let job = store.create_job(new_job(None)).unwrap();
        let sub = store
            .add_submission(NewSubmission {
                job_id: job.id.clone(),
                payload: serde_json::json!({"document": "essay-1.pdf"}),
            })
            .unwrap();
        assert_eq!(sub.status, SubmissionStatus::Queued);

        let claimed = store
            .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
            .unwrap();
        assert_eq!(claimed.status, SubmissionStatus::InProgress);
        assert!(claimed.started_at.is_some());

        // A second claim loses the compare-and-set.
        let err = store
            .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let requeued = store
            .transition_submission(
                &sub.id,
                SubmissionStatus::InProgress,
                SubmissionUpdate::Requeue {
                    ready_at: Utc::now(),
                    error: transient("HTTP 503"),
                },
            )
            .unwrap();
        assert_eq!(requeued.status, SubmissionStatus::Queued);
        assert_eq!(requeued.attempt_count, 1);
        assert_eq!(requeued.last_error, Some(transient("HTTP 503")));
        assert!(requeued.started_at.is_none());

        store
            .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
            .unwrap();
        let done = store
            .transition_submission(
                &sub.id,
                SubmissionStatus::InProgress,
                SubmissionUpdate::Complete {
                    output: "grade:A".to_string(),
                },
            )
            .unwrap();
        assert_eq!(done.status, SubmissionStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("grade:A"));
        assert_eq!(done.attempt_count, 1);

        // Completed submissions are immutable.
        let err = store
            .transition_submission(&sub.id, SubmissionStatus::Completed, SubmissionUpdate::Cancel)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_reset_failed_keeps_attempts() {
        let store = create_test_store();
        let job = store.create_job(new_job(None)).unwrap();
        let sub = store
            .add_submission(NewSubmission {
                job_id: job.id.clone(),
                payload: serde_json::json!("doc"),
            })
            .unwrap();

        for _ in 0..2 {
            store
                .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
                .unwrap();
            store
                .transition_submission(
                    &sub.id,
                    SubmissionStatus::InProgress,
                    SubmissionUpdate::Requeue {
                        ready_at: Utc::now(),
                        error: transient("timeout"),
                    },
                )
                .unwrap();
        }
        store
            .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
            .unwrap();
        store
            .transition_submission(
                &sub.id,
                SubmissionStatus::InProgress,
                SubmissionUpdate::Fail {
                    error: transient("timeout"),
                },
            )
            .unwrap();

        let reset = store.reset_failed_submissions(&job.id).unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].status, SubmissionStatus::Queued);
        assert_eq!(reset[0].attempt_count, 2);
        assert!(reset[0].completed_at.is_none());
    }

    #[test]
    fn test_tallies() {
        let store = create_test_store();
        let batch = store.create_batch(new_batch("a", 5, &[])).unwrap();
        let job = store.create_job(new_job(Some(&batch.id))).unwrap();
        let other = store.create_job(new_job(Some(&batch.id))).unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let sub = store
                .add_submission(NewSubmission {
                    job_id: job.id.clone(),
                    payload: serde_json::json!(i),
                })
                .unwrap();
            ids.push(sub.id);
        }

        store
            .transition_submission(&ids[0], SubmissionStatus::Queued, SubmissionUpdate::Claim)
            .unwrap();
        store
            .transition_submission(
                &ids[0],
                SubmissionStatus::InProgress,
                SubmissionUpdate::Complete {
                    output: "ok".to_string(),
                },
            )
            .unwrap();
        store
            .transition_submission(&ids[1], SubmissionStatus::Queued, SubmissionUpdate::Cancel)
            .unwrap();

        let tally = store.submission_tally(&job.id).unwrap();
        assert_eq!(tally.total, 4);
        assert_eq!(tally.completed, 1);
        assert_eq!(tally.cancelled, 1);
        assert_eq!(tally.open, 2);

        assert_eq!(store.cancel_open_submissions(&job.id).unwrap(), 2);
        assert!(store.submission_tally(&job.id).unwrap().all_terminal());

        store
            .transition_job(&other.id, WorkStatus::Draft, WorkStatus::Cancelled)
            .unwrap();
        let jobs = store.job_tally(&batch.id).unwrap();
        assert_eq!(jobs.total, 2);
        assert_eq!(jobs.cancelled, 1);
        assert_eq!(jobs.open, 1);
    }

    #[test]
    fn test_release_in_progress() {
        let store = create_test_store();
        let job = store.create_job(new_job(None)).unwrap();
        let sub = store
            .add_submission(NewSubmission {
                job_id: job.id.clone(),
                payload: serde_json::json!("doc"),
            })
            .unwrap();
        store
            .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
            .unwrap();

        assert_eq!(store.release_in_progress(&HashSet::new()).unwrap(), 1);
        let sub = store.get_submission(&sub.id).unwrap().unwrap();
        assert_eq!(sub.status, SubmissionStatus::Queued);
        assert_eq!(sub.attempt_count, 0);
    }

    #[test]
    fn test_release_in_progress_keeps_live_claims() {
        let store = create_test_store();
        let job = store.create_job(new_job(None)).unwrap();
        let ids: Vec<String> = (0..2)
            .map(|i| {
                let sub = store
                    .add_submission(NewSubmission {
                        job_id: job.id.clone(),
                        payload: serde_json::json!(i),
                    })
                    .unwrap();
                store
                    .transition_submission(&sub.id, SubmissionStatus::Queued, SubmissionUpdate::Claim)
                    .unwrap();
                sub.id
            })
            .collect();

        let keep: HashSet<String> = [ids[0].clone()].into_iter().collect();
        assert_eq!(store.release_in_progress(&keep).unwrap(), 1);

        let live = store.get_submission(&ids[0]).unwrap().unwrap();
        assert_eq!(live.status, SubmissionStatus::InProgress);
        let orphan = store.get_submission(&ids[1]).unwrap().unwrap();
        assert_eq!(orphan.status, SubmissionStatus::Queued);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteWorkStore::new(&dir.path().join("work.db")).unwrap();
        let conn = store.conn().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.db");

        let id = {
            let store = SqliteWorkStore::new(&path).unwrap();
            store.create_batch(new_batch("kept", 5, &[])).unwrap().id
        };

        let store = SqliteWorkStore::new(&path).unwrap();
        assert_eq!(store.get_batch(&id).unwrap().unwrap().name, "kept");
    }
}
