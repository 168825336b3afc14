use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row, ToSql};

use super::{EngineEvent, EventError, EventFilter, EventRecord, EventStore, EventSubject};

const INSERT_SQL: &str = "INSERT INTO engine_events \
    (timestamp, subject, event_type, entity_id, job_id, data) VALUES (?, ?, ?, ?, ?, ?)";

const RECORD_COLUMNS: &str = "id, timestamp, subject, event_type, entity_id, job_id, data";

/// SQLite-backed event log. Shares the database file with the work store.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Raw columns; decoded outside the rusqlite closure so payload errors keep
/// their own variant.
struct RawRecord {
    id: i64,
    timestamp: String,
    subject: String,
    event_type: String,
    entity_id: Option<String>,
    job_id: Option<String>,
    data: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            subject: row.get(2)?,
            event_type: row.get(3)?,
            entity_id: row.get(4)?,
            job_id: row.get(5)?,
            data: row.get(6)?,
        })
    }

    fn decode(self) -> Result<EventRecord, EventError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| EventError::Database(format!("invalid timestamp: {}", e)))?
            .with_timezone(&Utc);
        let subject: EventSubject = self.subject.parse().map_err(EventError::Serialization)?;
        let data: EngineEvent = serde_json::from_str(&self.data)?;

        Ok(EventRecord {
            id: self.id,
            timestamp,
            subject,
            event_type: self.event_type,
            entity_id: self.entity_id,
            job_id: self.job_id,
            data,
        })
    }
}

impl SqliteEventStore {
    pub fn new(path: &Path) -> Result<Self, EventError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, EventError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, EventError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS engine_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                subject TEXT NOT NULL,
                event_type TEXT NOT NULL,
                entity_id TEXT,
                job_id TEXT,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_engine_events_timestamp ON engine_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_engine_events_entity ON engine_events(subject, entity_id);
            CREATE INDEX IF NOT EXISTS idx_engine_events_job_id ON engine_events(job_id);
            CREATE INDEX IF NOT EXISTS idx_engine_events_event_type ON engine_events(event_type);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, EventError> {
        self.conn
            .lock()
            .map_err(|_| EventError::Database("connection mutex poisoned".to_string()))
    }

    fn where_clause(filter: &EventFilter) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(subject) = filter.subject {
            conditions.push("subject = ?");
            params.push(Box::new(subject.as_str()));
        }
        if let Some(ref entity_id) = filter.entity_id {
            conditions.push("entity_id = ?");
            params.push(Box::new(entity_id.clone()));
        }
        if let Some(ref job_id) = filter.job_id {
            conditions.push("job_id = ?");
            params.push(Box::new(job_id.clone()));
        }
        if let Some(ref event_type) = filter.event_type {
            conditions.push("event_type = ?");
            params.push(Box::new(event_type.clone()));
        }
        if let Some(ref from) = filter.from {
            conditions.push("timestamp >= ?");
            params.push(Box::new(ts(from)));
        }
        if let Some(ref to) = filter.to {
            conditions.push("timestamp <= ?");
            params.push(Box::new(ts(to)));
        }

        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), params)
        }
    }

    fn insert_with(conn: &Connection, record: &EventRecord) -> Result<i64, EventError> {
        let data = serde_json::to_string(&record.data)?;
        conn.execute(
            INSERT_SQL,
            params![
                ts(&record.timestamp),
                record.subject.as_str(),
                record.event_type,
                record.entity_id,
                record.job_id,
                data,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl EventStore for SqliteEventStore {
    fn insert(&self, record: &EventRecord) -> Result<i64, EventError> {
        let conn = self.conn()?;
        Self::insert_with(&conn, record)
    }

    /// One transaction per batch: a failure stores none of the records.
    fn insert_batch(&self, records: &[EventRecord]) -> Result<usize, EventError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in records {
            Self::insert_with(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, EventError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::where_clause(filter);
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let sql = format!(
            "SELECT {} FROM engine_events {} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            RECORD_COLUMNS, where_clause
        );
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(param_refs.as_slice(), RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter().map(RawRecord::decode).collect()
    }

    fn count(&self, filter: &EventFilter) -> Result<i64, EventError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM engine_events {}", where_clause);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        Ok(conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?)
    }
}
