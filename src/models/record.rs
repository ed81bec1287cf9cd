//! Anonymized dataset models
//!
//! These are the rows the ML pipeline owns: training records, lifecycle
//! events, user action patterns and monthly cost trends. Flexible-schema
//! columns (`metrics_summary`, `resource_config`, `top_waste_categories`)
//! are typed serde structs persisted as JSON text, and every training
//! record carries a `schema_version` so older rows survive format changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::{column_ts, ts};
use crate::models::resource::{Confidence, Provider};

/// Version stamped on every ML training record
pub const ML_SCHEMA_VERSION: i64 = 1;

/// The user's eventual decision on a detected resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAction {
    Deleted,
    Ignored,
    Kept,
}

impl UserAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserAction::Deleted => "deleted",
            UserAction::Ignored => "ignored",
            UserAction::Kept => "kept",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deleted" => Some(UserAction::Deleted),
            "ignored" => Some(UserAction::Ignored),
            "kept" => Some(UserAction::Kept),
            _ => None,
        }
    }
}

/// Direction label for a metric series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Volatile,
    Stable,
}

/// Statistical summary of a metric time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub trend: Trend,
}

/// Whitelisted projection of a resource's configuration. Anything the
/// whitelist does not name is dropped before a record is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub size_gb: Option<f64>,
    pub instance_type: Option<String>,
    pub performance_tier: Option<String>,
    pub environment: Option<String>,
    pub purpose: Option<String>,
}

/// One anonymized training row, derived 1:1 from a detection event
#[derive(Debug, Clone, Serialize)]
pub struct MlTrainingRecord {
    pub id: i64,
    pub schema_version: i64,
    pub account_hash: String,
    pub resource_hash: String,
    pub resource_type: String,
    pub provider: Provider,
    pub region_anonymized: String,
    pub resource_age_days: i64,
    pub detection_scenario: String,
    pub confidence_level: Confidence,
    pub metrics_summary: Option<MetricsSummary>,
    pub cost_monthly: f64,
    pub user_action: Option<UserAction>,
    pub resource_config: ResourceConfig,
    pub detected_at: DateTime<Utc>,
}

const ML_COLUMNS: &str = "id, schema_version, account_hash, resource_hash, resource_type, \
     provider, region_anonymized, resource_age_days, detection_scenario, confidence_level, \
     metrics_summary, cost_monthly, user_action, resource_config, detected_at";

fn bad_column(what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        what.to_string().into(),
    )
}

impl MlTrainingRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let provider_raw: String = row.get("provider")?;
        let confidence_raw: String = row.get("confidence_level")?;
        let metrics_raw: Option<String> = row.get("metrics_summary")?;
        let action_raw: Option<String> = row.get("user_action")?;
        let config_raw: String = row.get("resource_config")?;
        let detected_raw: String = row.get("detected_at")?;

        Ok(Self {
            id: row.get("id")?,
            schema_version: row.get("schema_version")?,
            account_hash: row.get("account_hash")?,
            resource_hash: row.get("resource_hash")?,
            resource_type: row.get("resource_type")?,
            provider: Provider::parse(&provider_raw)
                .ok_or_else(|| bad_column("unknown provider"))?,
            region_anonymized: row.get("region_anonymized")?,
            resource_age_days: row.get("resource_age_days")?,
            detection_scenario: row.get("detection_scenario")?,
            confidence_level: Confidence::parse(&confidence_raw)
                .ok_or_else(|| bad_column("unknown confidence"))?,
            metrics_summary: metrics_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|_| bad_column("bad metrics_summary"))?,
            cost_monthly: row.get("cost_monthly")?,
            user_action: action_raw.as_deref().and_then(UserAction::parse),
            resource_config: serde_json::from_str(&config_raw)
                .map_err(|_| bad_column("bad resource_config"))?,
            detected_at: column_ts(&detected_raw)?,
        })
    }

    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO ml_training_records \
             (schema_version, account_hash, resource_hash, resource_type, provider, \
              region_anonymized, resource_age_days, detection_scenario, confidence_level, \
              metrics_summary, cost_monthly, user_action, resource_config, detected_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                self.schema_version,
                self.account_hash,
                self.resource_hash,
                self.resource_type,
                self.provider.as_str(),
                self.region_anonymized,
                self.resource_age_days,
                self.detection_scenario,
                self.confidence_level.as_str(),
                self.metrics_summary
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .unwrap_or(None),
                self.cost_monthly,
                self.user_action.map(|a| a.as_str()),
                serde_json::to_string(&self.resource_config)
                    .unwrap_or_else(|_| "{}".to_string()),
                ts(self.detected_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent record for a resource hash, regardless of action state
    pub fn latest_for_hash(
        conn: &Connection,
        resource_hash: &str,
    ) -> rusqlite::Result<Option<Self>> {
        let sql = format!(
            "SELECT {ML_COLUMNS} FROM ml_training_records \
             WHERE resource_hash = ?1 ORDER BY detected_at DESC, id DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![resource_hash], Self::from_row)?;
        rows.next().transpose()
    }

    /// Claim the most recent null-action row for the hash, if any.
    /// A single conditional UPDATE keeps the read-modify-write atomic;
    /// returns how many rows changed (0 or 1).
    pub fn set_action_on_latest_null(
        conn: &Connection,
        resource_hash: &str,
        action: UserAction,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE ml_training_records SET user_action = ?1 \
             WHERE id = (SELECT id FROM ml_training_records \
                         WHERE resource_hash = ?2 AND user_action IS NULL \
                         ORDER BY detected_at DESC, id DESC LIMIT 1)",
            params![action.as_str(), resource_hash],
        )
    }

    /// All records for an account inside [start, end)
    pub fn for_account_between(
        conn: &Connection,
        account_hash: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> rusqlite::Result<Vec<Self>> {
        let sql = format!(
            "SELECT {ML_COLUMNS} FROM ml_training_records \
             WHERE account_hash = ?1 AND detected_at >= ?2 AND detected_at < ?3 \
             ORDER BY detected_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_hash, ts(start), ts(end)], Self::from_row)?;
        rows.collect()
    }

    pub fn all_for_hash(conn: &Connection, resource_hash: &str) -> rusqlite::Result<Vec<Self>> {
        let sql = format!(
            "SELECT {ML_COLUMNS} FROM ml_training_records \
             WHERE resource_hash = ?1 ORDER BY detected_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![resource_hash], Self::from_row)?;
        rows.collect()
    }

    /// Account hashes that have records since the given instant, used by the
    /// background aggregation pass
    pub fn accounts_since(
        conn: &Connection,
        since: DateTime<Utc>,
    ) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT account_hash FROM ml_training_records \
             WHERE detected_at >= ?1 ORDER BY account_hash",
        )?;
        let rows = stmt.query_map(params![ts(since)], |row| row.get(0))?;
        rows.collect()
    }
}

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    Detected,
    StatusChanged,
    Deleted,
    MetricsUpdated,
}

impl LifecycleEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventType::Detected => "detected",
            LifecycleEventType::StatusChanged => "status_changed",
            LifecycleEventType::Deleted => "deleted",
            LifecycleEventType::MetricsUpdated => "metrics_updated",
        }
    }
}

/// Append-only lifecycle log entry keyed by resource hash
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub resource_hash: String,
    pub event_type: LifecycleEventType,
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO resource_lifecycle_events (resource_hash, event_type, detail, occurred_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                self.resource_hash,
                self.event_type.as_str(),
                self.detail.to_string(),
                ts(self.occurred_at),
            ],
        )?;
        Ok(())
    }

    pub fn count_for_hash(conn: &Connection, resource_hash: &str) -> rusqlite::Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM resource_lifecycle_events WHERE resource_hash = ?1",
            params![resource_hash],
            |row| row.get(0),
        )
    }
}

/// One row per user decision event; append-only by design, so duplicate
/// decisions show up as distinct rows.
#[derive(Debug, Clone, Serialize)]
pub struct UserActionPattern {
    pub user_hash: String,
    pub account_hash: String,
    pub resource_hash: String,
    pub resource_type: String,
    pub detection_scenario: String,
    pub confidence_level: Confidence,
    pub action_taken: UserAction,
    pub time_to_action_hours: f64,
    pub cost_monthly: f64,
    pub cost_saved_monthly: f64,
    pub detected_at: DateTime<Utc>,
    pub action_at: DateTime<Utc>,
}

impl UserActionPattern {
    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO user_action_patterns \
             (user_hash, account_hash, resource_hash, resource_type, detection_scenario, \
              confidence_level, action_taken, time_to_action_hours, cost_monthly, \
              cost_saved_monthly, detected_at, action_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                self.user_hash,
                self.account_hash,
                self.resource_hash,
                self.resource_type,
                self.detection_scenario,
                self.confidence_level.as_str(),
                self.action_taken.as_str(),
                self.time_to_action_hours,
                self.cost_monthly,
                self.cost_saved_monthly,
                ts(self.detected_at),
                ts(self.action_at),
            ],
        )?;
        Ok(())
    }

    pub fn count_for_hash(conn: &Connection, resource_hash: &str) -> rusqlite::Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM user_action_patterns WHERE resource_hash = ?1",
            params![resource_hash],
            |row| row.get(0),
        )
    }
}

/// A resource type and its summed monthly cost inside one month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasteCategory {
    pub resource_type: String,
    pub cost_monthly: f64,
}

/// Monthly rollup for one (account, month, provider) key. Always the
/// output of a full recompute, never of incremental accumulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostTrendRecord {
    pub account_hash: String,
    pub month: String,
    pub provider: Provider,
    pub total_spend: f64,
    pub waste_detected: f64,
    pub waste_eliminated: f64,
    pub waste_percentage: f64,
    pub top_waste_categories: Vec<WasteCategory>,
    pub regional_breakdown: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
}

impl CostTrendRecord {
    pub fn upsert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO cost_trends \
             (account_hash, month, provider, total_spend, waste_detected, waste_eliminated, \
              waste_percentage, top_waste_categories, regional_breakdown, computed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT (account_hash, month, provider) DO UPDATE SET \
               total_spend = excluded.total_spend, \
               waste_detected = excluded.waste_detected, \
               waste_eliminated = excluded.waste_eliminated, \
               waste_percentage = excluded.waste_percentage, \
               top_waste_categories = excluded.top_waste_categories, \
               regional_breakdown = excluded.regional_breakdown, \
               computed_at = excluded.computed_at",
            params![
                self.account_hash,
                self.month,
                self.provider.as_str(),
                self.total_spend,
                self.waste_detected,
                self.waste_eliminated,
                self.waste_percentage,
                serde_json::to_string(&self.top_waste_categories)
                    .unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&self.regional_breakdown)
                    .unwrap_or_else(|_| "{}".to_string()),
                ts(self.computed_at),
            ],
        )?;
        Ok(())
    }

    pub fn find(
        conn: &Connection,
        account_hash: &str,
        month: &str,
        provider: Provider,
    ) -> rusqlite::Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT account_hash, month, provider, total_spend, waste_detected, \
                    waste_eliminated, waste_percentage, top_waste_categories, \
                    regional_breakdown, computed_at \
             FROM cost_trends WHERE account_hash = ?1 AND month = ?2 AND provider = ?3",
        )?;
        let mut rows = stmt.query_map(
            params![account_hash, month, provider.as_str()],
            |row| {
                let provider_raw: String = row.get("provider")?;
                let categories_raw: String = row.get("top_waste_categories")?;
                let regions_raw: String = row.get("regional_breakdown")?;
                let computed_raw: String = row.get("computed_at")?;
                Ok(Self {
                    account_hash: row.get("account_hash")?,
                    month: row.get("month")?,
                    provider: Provider::parse(&provider_raw)
                        .ok_or_else(|| bad_column("unknown provider"))?,
                    total_spend: row.get("total_spend")?,
                    waste_detected: row.get("waste_detected")?,
                    waste_eliminated: row.get("waste_eliminated")?,
                    waste_percentage: row.get("waste_percentage")?,
                    top_waste_categories: serde_json::from_str(&categories_raw)
                        .map_err(|_| bad_column("bad top_waste_categories"))?,
                    regional_breakdown: serde_json::from_str(&regions_raw)
                        .map_err(|_| bad_column("bad regional_breakdown"))?,
                    computed_at: column_ts(&computed_raw)?,
                })
            },
        )?;
        rows.next().transpose()
    }
}

/// Reported monthly account spend, the waste_percentage denominator
pub struct AccountSpend;

impl AccountSpend {
    pub fn upsert(
        conn: &Connection,
        account_hash: &str,
        month: &str,
        provider: Provider,
        total_spend: f64,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO account_spend (account_hash, month, provider, total_spend, reported_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (account_hash, month, provider) DO UPDATE SET \
               total_spend = excluded.total_spend, reported_at = excluded.reported_at",
            params![account_hash, month, provider.as_str(), total_spend, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get(
        conn: &Connection,
        account_hash: &str,
        month: &str,
        provider: Provider,
    ) -> rusqlite::Result<Option<f64>> {
        let mut stmt = conn.prepare(
            "SELECT total_spend FROM account_spend \
             WHERE account_hash = ?1 AND month = ?2 AND provider = ?3",
        )?;
        let mut rows =
            stmt.query_map(params![account_hash, month, provider.as_str()], |row| {
                row.get(0)
            })?;
        rows.next().transpose()
    }
}

/// Counters for the admin stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MlStats {
    pub total_ml_records: i64,
    pub total_user_actions: i64,
    pub total_cost_trends: i64,
    pub records_last_7_days: i64,
    pub records_last_30_days: i64,
    pub last_collection_date: Option<DateTime<Utc>>,
}

impl MlStats {
    pub fn gather(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<Self> {
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        let since = |days: i64| -> rusqlite::Result<i64> {
            conn.query_row(
                "SELECT COUNT(*) FROM ml_training_records WHERE detected_at >= ?1",
                params![ts(now - chrono::Duration::days(days))],
                |r| r.get(0),
            )
        };

        let last_raw: Option<String> = conn.query_row(
            "SELECT MAX(detected_at) FROM ml_training_records",
            [],
            |r| r.get(0),
        )?;

        Ok(Self {
            total_ml_records: count("SELECT COUNT(*) FROM ml_training_records")?,
            total_user_actions: count("SELECT COUNT(*) FROM user_action_patterns")?,
            total_cost_trends: count("SELECT COUNT(*) FROM cost_trends")?,
            records_last_7_days: since(7)?,
            records_last_30_days: since(30)?,
            last_collection_date: last_raw.as_deref().and_then(crate::db::parse_ts),
        })
    }
}
