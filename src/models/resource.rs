//! Scanner-facing resource types and raw detection events

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::ts;

/// Cloud provider a resource belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    M365,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::M365 => "m365",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "aws" => Some(Provider::Aws),
            "azure" => Some(Provider::Azure),
            "gcp" => Some(Provider::Gcp),
            "m365" => Some(Provider::M365),
            _ => None,
        }
    }
}

/// Detection confidence tier, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Critical,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
            Confidence::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            "critical" => Some(Confidence::Critical),
            _ => None,
        }
    }
}

/// One sample of a resource metric time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Raw resource descriptor as delivered by a provider scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_id: String,
    pub resource_type: String,
    pub provider: Provider,
    pub region: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size_gb: Option<f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metric_timeseries: Vec<MetricSample>,
    pub estimated_monthly_cost: f64,
}

impl ResourceDescriptor {
    /// Days since creation
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    /// Days the resource has sat idle: since last access when the scanner
    /// reports one, since creation otherwise.
    pub fn idle_days(&self, now: DateTime<Utc>) -> i64 {
        let reference = self.last_accessed_at.unwrap_or(self.created_at);
        (now - reference).num_days().max(0)
    }
}

/// Raw, identifiable detection. One row per resource per scan; immutable
/// once written, superseded by the next scan's event for the same resource.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    pub scan_id: Uuid,
    pub resource_id: String,
    pub resource_type: String,
    pub provider: Provider,
    pub region: String,
    pub state: String,
    pub age_days: i64,
    pub size_gb: Option<f64>,
    pub estimated_monthly_cost: f64,
    pub metrics: Vec<MetricSample>,
    pub tags: BTreeMap<String, String>,
    pub confidence: Confidence,
    pub detection_scenario: String,
    pub detected_at: DateTime<Utc>,
}

impl DetectionEvent {
    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO detection_events \
             (scan_id, resource_id, resource_type, provider, region, state, age_days, \
              size_gb, estimated_monthly_cost, metrics, tags, confidence, \
              detection_scenario, detected_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                self.scan_id.to_string(),
                self.resource_id,
                self.resource_type,
                self.provider.as_str(),
                self.region,
                self.state,
                self.age_days,
                self.size_gb,
                self.estimated_monthly_cost,
                serde_json::to_string(&self.metrics).ok(),
                serde_json::to_string(&self.tags).unwrap_or_else(|_| "{}".to_string()),
                self.confidence.as_str(),
                self.detection_scenario,
                ts(self.detected_at),
            ],
        )?;
        Ok(())
    }

    pub fn count_for_scan(conn: &Connection, scan_id: Uuid) -> rusqlite::Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM detection_events WHERE scan_id = ?1",
            params![scan_id.to_string()],
            |row| row.get(0),
        )
    }
}
