//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::probe::{Outcome, ProtocolKind};

/// Fixed-width timestamp format; lexical order matches time order.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str = "id, name, address, kind, is_active, created_at";
const CHECK_COLUMNS: &str =
    "id, target_id, checked_at, outcome, response_time_ms, status_code, error_message";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Database connection lock poisoned")]
    Poisoned,
}

/// Append side of the check history.
///
/// The monitor only ever writes through this; reads go through [`Store`].
pub trait HistoryStore: Send + Sync {
    /// Persist one record and return its id.
    fn append_check(&self, record: &CheckRecord) -> Result<i64, DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Embedded SQL; statements are idempotent
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO targets (name, address, kind, is_active, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.name,
                target.address,
                target.kind.as_str(),
                target.is_active,
                format_db_time(&target.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Update an existing target.
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE targets SET name=?1, address=?2, kind=?3, is_active=?4 WHERE id=?5",
            params![
                target.name,
                target.address,
                target.kind.as_str(),
                target.is_active,
                target.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all targets, newest first.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets ORDER BY created_at DESC, id DESC",
            TARGET_COLUMNS
        ))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get the targets that bulk runs should probe.
    pub fn get_active_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE is_active = 1 ORDER BY id ASC",
            TARGET_COLUMNS
        ))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get every target with its latest check attached.
    pub fn get_target_statuses(&self) -> Result<Vec<TargetStatus>, DbError> {
        let targets = self.get_targets()?;
        let conn = self.lock()?;
        targets
            .into_iter()
            .map(|target| {
                let latest_check = latest_check(&conn, target.id)?;
                Ok(TargetStatus {
                    target,
                    latest_check,
                })
            })
            .collect()
    }

    /// Delete a target and its check history.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM check_records WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Check history ---

    /// Get the checks for a target within `[since, until]`, most recent first.
    pub fn get_checks(
        &self,
        target_id: i64,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CheckRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM check_records
             WHERE target_id = ?1 AND checked_at >= ?2 AND checked_at <= ?3
             ORDER BY checked_at DESC, id DESC",
            CHECK_COLUMNS
        ))?;

        let records = stmt
            .query_map(
                params![target_id, format_db_time(&since), format_db_time(&until)],
                check_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Get the most recent check for a target, if it has ever been checked.
    pub fn get_latest_check(&self, target_id: i64) -> Result<Option<CheckRecord>, DbError> {
        let conn = self.lock()?;
        latest_check(&conn, target_id)
    }
}

impl HistoryStore for Store {
    fn append_check(&self, record: &CheckRecord) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO check_records (target_id, checked_at, outcome, response_time_ms, status_code, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.target_id,
                format_db_time(&record.checked_at),
                record.outcome.as_str(),
                record.response_time_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
                record.status_code,
                record.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn latest_check(conn: &Connection, target_id: i64) -> Result<Option<CheckRecord>, DbError> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM check_records WHERE target_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT 1",
                CHECK_COLUMNS
            ),
            params![target_id],
            check_from_row,
        )
        .optional()?;
    Ok(record)
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        kind: kind
            .parse::<ProtocolKind>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        is_active: row.get(4)?,
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
    })
}

fn check_from_row(row: &Row<'_>) -> SqlResult<CheckRecord> {
    let checked_at: String = row.get(2)?;
    let outcome: String = row.get(3)?;
    let response_time_ms: Option<i64> = row.get(4)?;
    Ok(CheckRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        checked_at: parse_db_time(&checked_at).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unreadable checked_at: {:?}", checked_at).into(),
            )
        })?,
        outcome: outcome
            .parse::<Outcome>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        response_time_ms: response_time_ms.and_then(|ms| u64::try_from(ms).ok()),
        status_code: row.get(5)?,
        error_message: row.get(6)?,
    })
}

fn format_db_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

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
