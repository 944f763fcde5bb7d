use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{Event, EventRecord};
use tessera_core::traits::Store;
use tessera_core::types::RunId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS events (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        emitter TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (run_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_events_type ON events(run_id, event_type);";

/// SQLite-backed event store. `(run_id, seq)` is the primary key, so a second
/// writer racing on the same sequence number is rejected by the database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TesseraError::Store(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets readers replay while the run keeps appending
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of events stored for a run.
    pub fn count(&self, run_id: &RunId) -> Result<u64> {
        let conn = self.conn.lock().map_err(|e| TesseraError::Store(e.to_string()))?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as u64)
    }
}

impl Store for SqliteStore {
    fn append(&self, run_id: &RunId, event: &Event) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.as_str().to_string();
        let record = event.to_record();

        Box::pin(async move {
            let record = record?;
            let payload = serde_json::to_string(&record.payload)?;
            let conn = self.conn.lock().map_err(|e| TesseraError::Store(e.to_string()))?;

            let last = conn
                .query_row(
                    "SELECT MAX(seq) FROM events WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map_err(db_err)?;
            let expected = last.map(|s| s as u64 + 1).unwrap_or(0);
            if record.seq != expected {
                return Err(TesseraError::SequenceConflict {
                    expected,
                    actual: record.seq,
                });
            }

            conn.execute(
                "INSERT INTO events (run_id, seq, id, timestamp, event_type, emitter, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    record.seq as i64,
                    record.id,
                    record.timestamp.to_rfc3339(),
                    record.event_type,
                    record.emitter,
                    payload,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == ErrorCode::ConstraintViolation =>
                {
                    TesseraError::SequenceConflict {
                        expected,
                        actual: record.seq,
                    }
                }
                other => db_err(other),
            })?;

            Ok(())
        })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>> {
        let run_id = run_id.as_str().to_string();

        Box::pin(async move {
            let rows = {
                let conn = self.conn.lock().map_err(|e| TesseraError::Store(e.to_string()))?;
                let mut stmt = conn
                    .prepare(
                        "SELECT seq, id, timestamp, event_type, emitter, payload FROM events
                         WHERE run_id = ?1
                         ORDER BY seq ASC",
                    )
                    .map_err(db_err)?;

                let rows = stmt
                    .query_map(params![run_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })
                    .map_err(db_err)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?
            };

            let mut events = Vec::with_capacity(rows.len());
            for (seq, id, ts, event_type, emitter, payload) in rows {
                let seq = seq as u64;
                let timestamp = DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| TesseraError::CorruptEvent {
                        seq,
                        message: format!("bad timestamp: {}", e),
                    })?;
                let payload = serde_json::from_str(&payload).map_err(|e| {
                    TesseraError::CorruptEvent {
                        seq,
                        message: format!("bad payload: {}", e),
                    }
                })?;
                events.push(Event::from_record(EventRecord {
                    id,
                    seq,
                    timestamp,
                    event_type,
                    emitter,
                    payload,
                })?);
            }

            Ok(events)
        })
    }

    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(|e| TesseraError::Store(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT run_id FROM events
                     GROUP BY run_id
                     ORDER BY MIN(timestamp) ASC",
                )
                .map_err(db_err)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(ids.into_iter().map(RunId).collect())
        })
    }
}

fn db_err(e: rusqlite::Error) -> TesseraError {
    TesseraError::Store(e.to_string())
}
