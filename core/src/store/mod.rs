//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database. Components call store
//! methods — they never execute SQL directly.

use crate::error::EngineResult;
use crate::event::EventLogEntry;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};

mod attribution;
mod decision;
mod insight;
mod metrics;
mod mmm;

pub use metrics::EntityWindowTotals;

pub struct EngineStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl EngineStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases this returns a fresh, isolated database.
    pub fn reopen(&self) -> EngineResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_source_tables.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_metrics.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_attribution.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_mmm.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/006_insights.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/007_decisions.sql"))?;
        Ok(())
    }

    /// Begin an explicit transaction. Batch writes (attribution runs,
    /// insight persistence) commit atomically or not at all.
    pub fn transaction(&self) -> EngineResult<rusqlite::Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(
        &self,
        run_id: &str,
        seed: u64,
        version: &str,
        as_of: NaiveDate,
        lookback_days: u32,
        started_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, seed, version, as_of, lookback_days, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running')",
            params![
                run_id,
                seed as i64,
                version,
                sql_date(as_of),
                lookback_days as i64,
                started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_run_completed(
        &self,
        run_id: &str,
        finished_at: DateTime<Utc>,
        entities_processed: usize,
        entities_total: usize,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE run SET status = 'completed', finished_at = ?1,
             entities_processed = ?2, entities_total = ?3
             WHERE run_id = ?4",
            params![
                finished_at.to_rfc3339(),
                entities_processed as i64,
                entities_total as i64,
                run_id
            ],
        )?;
        Ok(())
    }

    pub fn mark_run_failed(
        &self,
        run_id: &str,
        stage: &str,
        error: &str,
        entities_processed: usize,
        entities_total: usize,
        finished_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE run SET status = 'failed', failed_stage = ?1, error = ?2,
             entities_processed = ?3, entities_total = ?4, finished_at = ?5
             WHERE run_id = ?6",
            params![
                stage,
                error,
                entities_processed as i64,
                entities_total as i64,
                finished_at.to_rfc3339(),
                run_id
            ],
        )?;
        Ok(())
    }

    pub fn run_summary(&self, run_id: &str) -> EngineResult<RunSummary> {
        self.conn
            .query_row(
                "SELECT run_id, status, failed_stage, entities_processed, entities_total,
                        started_at, finished_at, error
                 FROM run WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunSummary {
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        failed_stage: row.get(2)?,
                        entities_processed: row.get::<_, i64>(3)? as usize,
                        entities_total: row.get::<_, i64>(4)? as usize,
                        started_at: row.get(5)?,
                        finished_at: row.get(6)?,
                        error: row.get(7)?,
                    })
                },
            )
            .map_err(Into::into)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, stage, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.stage,
                entry.event_type,
                entry.payload,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, stage, event_type, payload, created_at
             FROM event_log WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    stage: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, run_id: &str, event_type: &str) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM event_log WHERE run_id = ?1 AND event_type = ?2",
                params![run_id, event_type],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    // ── Stage health ───────────────────────────────────────────

    pub fn insert_stage_health(
        &self,
        run_id: &str,
        stage: &str,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        items_processed: usize,
        failures: usize,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO stage_health (run_id, stage, started_at, duration_ms, items_processed, failures)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                stage,
                started_at.to_rfc3339(),
                duration_ms as i64,
                items_processed as i64,
                failures as i64,
            ],
        )?;
        Ok(())
    }

    pub fn stage_health_for_run(&self, run_id: &str) -> EngineResult<Vec<StageHealth>> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, started_at, duration_ms, items_processed, failures
             FROM stage_health WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StageHealth {
                    stage: row.get(0)?,
                    started_at: row.get(1)?,
                    duration_ms: row.get::<_, i64>(2)? as u64,
                    items_processed: row.get::<_, i64>(3)? as usize,
                    failures: row.get::<_, i64>(4)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub failed_stage: Option<String>,
    pub entities_processed: usize,
    pub entities_total: usize,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StageHealth {
    pub stage: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub items_processed: usize,
    pub failures: usize,
}

// ── Column conversion helpers ────────────────────────────────────────

pub(crate) fn sql_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_datetime(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}
