//! Detection rule model
//!
//! One `'default'` row per resource type plus optional per-user override
//! rows. Override columns are nullable: NULL means "not set, use the
//! default". Merging therefore happens field-by-field at resolution time.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::{column_ts, ts};

/// `owner_scope` value for system-wide default rules
pub const DEFAULT_SCOPE: &str = "default";

/// A stored rule row (default or override)
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRule {
    pub resource_type: String,
    pub owner_scope: String,
    pub enabled: Option<bool>,
    pub min_age_days: Option<i64>,
    pub min_stopped_days: Option<i64>,
    pub confidence_critical_days: Option<i64>,
    pub confidence_high_days: Option<i64>,
    pub confidence_medium_days: Option<i64>,
    pub extra_fields: serde_json::Value,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update supplied by a user. Absent fields keep their current
/// effective value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub enabled: Option<bool>,
    pub min_age_days: Option<i64>,
    pub min_stopped_days: Option<i64>,
    pub confidence_critical_days: Option<i64>,
    pub confidence_high_days: Option<i64>,
    pub confidence_medium_days: Option<i64>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.min_age_days.is_none()
            && self.min_stopped_days.is_none()
            && self.confidence_critical_days.is_none()
            && self.confidence_high_days.is_none()
            && self.confidence_medium_days.is_none()
    }
}

/// The merged default + override view used by the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveRule {
    pub resource_type: String,
    pub enabled: bool,
    pub min_age_days: Option<i64>,
    pub min_stopped_days: Option<i64>,
    pub confidence_critical_days: i64,
    pub confidence_high_days: i64,
    pub confidence_medium_days: i64,
}

const COLUMNS: &str = "resource_type, owner_scope, enabled, min_age_days, min_stopped_days, \
     confidence_critical_days, confidence_high_days, confidence_medium_days, \
     extra_fields, description, updated_at";

impl DetectionRule {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let extra_raw: String = row.get("extra_fields")?;
        let updated_raw: String = row.get("updated_at")?;
        Ok(Self {
            resource_type: row.get("resource_type")?,
            owner_scope: row.get("owner_scope")?,
            enabled: row.get("enabled")?,
            min_age_days: row.get("min_age_days")?,
            min_stopped_days: row.get("min_stopped_days")?,
            confidence_critical_days: row.get("confidence_critical_days")?,
            confidence_high_days: row.get("confidence_high_days")?,
            confidence_medium_days: row.get("confidence_medium_days")?,
            extra_fields: serde_json::from_str(&extra_raw).unwrap_or(serde_json::Value::Null),
            description: row.get("description")?,
            updated_at: column_ts(&updated_raw)?,
        })
    }

    pub fn find(
        conn: &Connection,
        resource_type: &str,
        owner_scope: &str,
    ) -> rusqlite::Result<Option<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM detection_rules WHERE resource_type = ?1 AND owner_scope = ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![resource_type, owner_scope], Self::from_row)?;
        rows.next().transpose()
    }

    pub fn list_defaults(conn: &Connection) -> rusqlite::Result<Vec<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM detection_rules WHERE owner_scope = ?1 ORDER BY resource_type"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![DEFAULT_SCOPE], Self::from_row)?;
        rows.collect()
    }

    /// Insert a default rule if none exists for the resource type yet
    #[allow(clippy::too_many_arguments)]
    pub fn seed_default(
        conn: &Connection,
        resource_type: &str,
        enabled: bool,
        min_age_days: Option<i64>,
        min_stopped_days: Option<i64>,
        critical: i64,
        high: i64,
        medium: i64,
        description: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO detection_rules \
             (resource_type, owner_scope, enabled, min_age_days, min_stopped_days, \
              confidence_critical_days, confidence_high_days, confidence_medium_days, \
              extra_fields, description, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '{}', ?9, ?10)",
            params![
                resource_type,
                DEFAULT_SCOPE,
                enabled,
                min_age_days,
                min_stopped_days,
                critical,
                high,
                medium,
                description,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Upsert a user override row from a patch. Only patched fields become
    /// non-NULL; an existing override keeps previously set fields.
    pub fn upsert_override(
        conn: &Connection,
        resource_type: &str,
        user_id: &str,
        patch: &RulePatch,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO detection_rules \
             (resource_type, owner_scope, enabled, min_age_days, min_stopped_days, \
              confidence_critical_days, confidence_high_days, confidence_medium_days, \
              extra_fields, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '{}', ?9) \
             ON CONFLICT (resource_type, owner_scope) DO UPDATE SET \
               enabled = COALESCE(excluded.enabled, detection_rules.enabled), \
               min_age_days = COALESCE(excluded.min_age_days, detection_rules.min_age_days), \
               min_stopped_days = COALESCE(excluded.min_stopped_days, detection_rules.min_stopped_days), \
               confidence_critical_days = COALESCE(excluded.confidence_critical_days, detection_rules.confidence_critical_days), \
               confidence_high_days = COALESCE(excluded.confidence_high_days, detection_rules.confidence_high_days), \
               confidence_medium_days = COALESCE(excluded.confidence_medium_days, detection_rules.confidence_medium_days), \
               updated_at = excluded.updated_at",
            params![
                resource_type,
                user_id,
                patch.enabled,
                patch.min_age_days,
                patch.min_stopped_days,
                patch.confidence_critical_days,
                patch.confidence_high_days,
                patch.confidence_medium_days,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Delete one override. Returns whether a row was removed. Never touches
    /// the default row.
    pub fn delete_override(
        conn: &Connection,
        resource_type: &str,
        user_id: &str,
    ) -> rusqlite::Result<bool> {
        let changed = conn.execute(
            "DELETE FROM detection_rules \
             WHERE resource_type = ?1 AND owner_scope = ?2 AND owner_scope != ?3",
            params![resource_type, user_id, DEFAULT_SCOPE],
        )?;
        Ok(changed > 0)
    }

    /// Delete all overrides for a user. Returns how many were removed.
    pub fn delete_all_overrides(conn: &Connection, user_id: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "DELETE FROM detection_rules WHERE owner_scope = ?1 AND owner_scope != ?2",
            params![user_id, DEFAULT_SCOPE],
        )
    }
}
