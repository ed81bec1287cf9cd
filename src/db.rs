//! Database module - embedded SQLite schema and shared connection
//!
//! Timestamps are stored as fixed-width UTC text (`%Y-%m-%dT%H:%M:%S%.3fZ`)
//! so lexicographic comparison in SQL matches chronological order.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::CoreResult;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp for storage.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

/// Parse a stored timestamp.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse a stored timestamp inside a row-mapping closure.
pub fn column_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad timestamp '{raw}'").into(),
        )
    })
}

/// Shared database handle
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!("Database schema applied");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure with exclusive access to the connection
    pub fn with<T>(&self, f: impl FnOnce(&mut Connection) -> CoreResult<T>) -> CoreResult<T> {
        let mut guard = self.conn.lock();
        f(&mut guard)
    }
}

/// Database schema SQL
const SCHEMA_SQL: &str = r#"
-- Detection rules: one 'default' row per resource type plus per-user
-- override rows. Override columns are nullable; a NULL means "not set,
-- fall through to the default" (partial-override semantics).
CREATE TABLE IF NOT EXISTS detection_rules (
    resource_type            TEXT NOT NULL,
    owner_scope              TEXT NOT NULL,
    enabled                  INTEGER,
    min_age_days             INTEGER,
    min_stopped_days         INTEGER,
    confidence_critical_days INTEGER,
    confidence_high_days     INTEGER,
    confidence_medium_days   INTEGER,
    extra_fields             TEXT NOT NULL DEFAULT '{}',
    description              TEXT,
    updated_at               TEXT NOT NULL,
    PRIMARY KEY (resource_type, owner_scope)
);

-- Raw detections, one per resource per scan. Immutable; a later scan
-- supersedes rather than overwrites.
CREATE TABLE IF NOT EXISTS detection_events (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id                TEXT NOT NULL,
    resource_id            TEXT NOT NULL,
    resource_type          TEXT NOT NULL,
    provider               TEXT NOT NULL,
    region                 TEXT NOT NULL,
    state                  TEXT NOT NULL,
    age_days               INTEGER NOT NULL,
    size_gb                REAL,
    estimated_monthly_cost REAL NOT NULL,
    metrics                TEXT,
    tags                   TEXT NOT NULL DEFAULT '{}',
    confidence             TEXT NOT NULL,
    detection_scenario     TEXT NOT NULL,
    detected_at            TEXT NOT NULL
);

-- Anonymized training rows. Append-only: several rows may share a
-- resource_hash (one per detecting scan); user_action is set at most
-- once per row by the action tracker.
CREATE TABLE IF NOT EXISTS ml_training_records (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    schema_version     INTEGER NOT NULL,
    account_hash       TEXT NOT NULL,
    resource_hash      TEXT NOT NULL,
    resource_type      TEXT NOT NULL,
    provider           TEXT NOT NULL,
    region_anonymized  TEXT NOT NULL,
    resource_age_days  INTEGER NOT NULL,
    detection_scenario TEXT NOT NULL,
    confidence_level   TEXT NOT NULL,
    metrics_summary    TEXT,
    cost_monthly       REAL NOT NULL,
    user_action        TEXT,
    resource_config    TEXT NOT NULL,
    detected_at        TEXT NOT NULL
);

-- Append-only lifecycle log per anonymized resource.
CREATE TABLE IF NOT EXISTS resource_lifecycle_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_hash TEXT NOT NULL,
    event_type    TEXT NOT NULL,
    detail        TEXT NOT NULL DEFAULT '{}',
    occurred_at   TEXT NOT NULL
);

-- One row per user decision event; never updated.
CREATE TABLE IF NOT EXISTS user_action_patterns (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    user_hash            TEXT NOT NULL,
    account_hash         TEXT NOT NULL,
    resource_hash        TEXT NOT NULL,
    resource_type        TEXT NOT NULL,
    detection_scenario   TEXT NOT NULL,
    confidence_level     TEXT NOT NULL,
    action_taken         TEXT NOT NULL,
    time_to_action_hours REAL NOT NULL,
    cost_monthly         REAL NOT NULL,
    cost_saved_monthly   REAL NOT NULL,
    detected_at          TEXT NOT NULL,
    action_at            TEXT NOT NULL
);

-- Monthly rollups, recomputed in full on every aggregation run.
CREATE TABLE IF NOT EXISTS cost_trends (
    account_hash         TEXT NOT NULL,
    month                TEXT NOT NULL,
    provider             TEXT NOT NULL,
    total_spend          REAL NOT NULL,
    waste_detected       REAL NOT NULL,
    waste_eliminated     REAL NOT NULL,
    waste_percentage     REAL NOT NULL,
    top_waste_categories TEXT NOT NULL,
    regional_breakdown   TEXT NOT NULL,
    computed_at          TEXT NOT NULL,
    PRIMARY KEY (account_hash, month, provider)
);

-- Reported account spend, the denominator for waste_percentage.
-- Billing accuracy is out of scope; scanners may report it, absent
-- spend aggregates as zero.
CREATE TABLE IF NOT EXISTS account_spend (
    account_hash TEXT NOT NULL,
    month        TEXT NOT NULL,
    provider     TEXT NOT NULL,
    total_spend  REAL NOT NULL,
    reported_at  TEXT NOT NULL,
    PRIMARY KEY (account_hash, month, provider)
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_detection_events_scan ON detection_events(scan_id);
CREATE INDEX IF NOT EXISTS idx_ml_records_hash ON ml_training_records(resource_hash, detected_at);
CREATE INDEX IF NOT EXISTS idx_ml_records_account ON ml_training_records(account_hash, detected_at);
CREATE INDEX IF NOT EXISTS idx_lifecycle_hash ON resource_lifecycle_events(resource_hash);
CREATE INDEX IF NOT EXISTS idx_patterns_hash ON user_action_patterns(resource_hash);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schema_applies_cleanly() {
        let db = Db::open_in_memory().unwrap();
        let count: i64 = db
            .with(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(count >= 7);
    }

    #[test]
    fn timestamp_roundtrip_and_ordering() {
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(500);

        assert_eq!(parse_ts(&ts(early)), Some(early));
        // Fixed-width millis keep text order == time order.
        assert!(ts(early) < ts(late));
    }
}
