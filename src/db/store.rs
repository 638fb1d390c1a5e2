//! SQLite snapshot store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;
use crate::uptime::{ServerId, ServerKind, ServerRecord, ServerStats};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Background task failed: {0}")]
    Background(String),
}

/// Thread-safe snapshot store.
///
/// Only the persistence scheduler writes here, always as one full snapshot
/// per transaction.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at the given path and migrate it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let mut conn = Connection::open(&path)?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the stored snapshot with the given records.
    pub fn write_snapshot(&self, records: &[ServerRecord]) -> Result<SnapshotInfo, DbError> {
        let written_at = Utc::now();
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        tx.execute("DELETE FROM servers", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO servers (kind, host, port, attempts, successes, last_latency_ms, avg_latency_ms,
                 last_success, last_attempt, uptime_secs, max_uptime_secs, last_uptime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for r in records {
                let s = &r.stats;
                stmt.execute(params![
                    r.id.kind.as_str(),
                    r.id.host,
                    r.id.port,
                    s.attempts as i64,
                    s.successes as i64,
                    s.last_latency_ms,
                    s.avg_latency_ms,
                    s.last_success.map(format_db_time),
                    s.last_attempt.map(format_db_time),
                    s.uptime_secs as i64,
                    s.max_uptime_secs as i64,
                    s.last_uptime.map(format_db_time),
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO snapshots (id, written_at, records) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET written_at=excluded.written_at, records=excluded.records",
            params![format_db_time(written_at), records.len() as i64],
        )?;
        tx.commit()?;

        Ok(SnapshotInfo {
            path: self.path.display().to_string(),
            records: records.len(),
            written_at,
        })
    }

    /// Load every record from the last snapshot.
    ///
    /// Rows with an unknown kind are skipped.
    pub fn load_snapshot(&self) -> Result<Vec<ServerRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, host, port, attempts, successes, last_latency_ms, avg_latency_ms,
             last_success, last_attempt, uptime_secs, max_uptime_secs, last_uptime
             FROM servers ORDER BY kind, host, port",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(0)?;
                let stats = ServerStats {
                    attempts: row.get::<_, i64>(3)?.max(0) as u64,
                    successes: row.get::<_, i64>(4)?.max(0) as u64,
                    last_latency_ms: row.get(5)?,
                    avg_latency_ms: row.get(6)?,
                    last_success: read_time(row.get(7)?),
                    last_attempt: read_time(row.get(8)?),
                    uptime_secs: row.get::<_, i64>(9)?.max(0) as u64,
                    max_uptime_secs: row.get::<_, i64>(10)?.max(0) as u64,
                    last_uptime: read_time(row.get(11)?),
                };
                Ok((kind, row.get::<_, String>(1)?, row.get::<_, u16>(2)?, stats))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (kind, host, port, stats) in rows {
            match kind.parse::<ServerKind>() {
                Ok(kind) => records.push(ServerRecord {
                    id: ServerId::new(kind, host, port),
                    stats,
                }),
                Err(e) => tracing::warn!("Skipping stored server {}:{}: {}", host, port, e),
            }
        }

        Ok(records)
    }

    /// When the last snapshot was written, if ever.
    pub fn last_snapshot_time(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn();
        let result: Option<String> = conn
            .query_row("SELECT written_at FROM snapshots WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        Ok(result.and_then(|s| parse_db_time(&s)))
    }
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn read_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_db_time)
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
