//! Scan orchestration
//!
//! Takes one scanner delivery (a batch of raw resource descriptors for a
//! single account) through the detection pipeline: resolve rules, gate,
//! classify, persist the raw event, then hand the batch to the collector.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::logic::{anonymize::Anonymizer, classify, collector, rules};
use crate::models::{AccountSpend, DetectionEvent, Provider, ResourceDescriptor};

/// One scanner delivery
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    /// Supplied by the task runner for idempotent retries; generated when absent
    pub scan_id: Option<Uuid>,
    pub cloud_account_id: String,
    pub provider: Provider,
    /// Reported account spend for the current month, when the scanner has it
    #[serde(default)]
    pub account_monthly_spend: Option<f64>,
    pub resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct ScanOutcome {
    pub scan_id: Uuid,
    /// Raw detection events persisted
    pub detections: usize,
    /// Anonymized training records written (≤ detections on partial failure)
    pub records_written: usize,
    /// Resources gated out by rules (disabled, too young, not stopped long enough)
    pub skipped: usize,
}

/// Decide whether a resource is detectable under its effective rule, and
/// with which confidence. `None` means gated out.
fn evaluate(
    conn: &Connection,
    user_id: &str,
    resource: &ResourceDescriptor,
    now: DateTime<Utc>,
) -> Option<DetectionEvent> {
    let rule = rules::resolve_or_fallback(conn, &resource.resource_type, user_id);
    if !rule.enabled {
        return None;
    }

    let creation_age = resource.age_days(now);
    if let Some(min_age) = rule.min_age_days {
        if creation_age < min_age {
            return None;
        }
    }

    let idle_days = resource.idle_days(now);
    if resource.state == "stopped" {
        if let Some(min_stopped) = rule.min_stopped_days {
            if idle_days < min_stopped {
                return None;
            }
        }
    }

    let confidence = classify::classify(idle_days, &rule);
    Some(DetectionEvent {
        scan_id: Uuid::nil(), // filled in by run_scan
        resource_id: resource.resource_id.clone(),
        resource_type: resource.resource_type.clone(),
        provider: resource.provider,
        region: resource.region.clone(),
        state: resource.state.clone(),
        age_days: idle_days,
        size_gb: resource.size_gb,
        estimated_monthly_cost: resource.estimated_monthly_cost,
        metrics: resource.metric_timeseries.clone(),
        tags: resource.tags.clone(),
        confidence,
        detection_scenario: classify::scenario_for(&resource.resource_type, &resource.state),
        detected_at: now,
    })
}

pub fn run_scan(
    conn: &mut Connection,
    anonymizer: &Anonymizer,
    user_id: &str,
    request: &ScanRequest,
    now: DateTime<Utc>,
) -> CoreResult<ScanOutcome> {
    let scan_id = request.scan_id.unwrap_or_else(Uuid::new_v4);
    tracing::info!(
        %scan_id,
        provider = request.provider.as_str(),
        resources = request.resources.len(),
        "Scan ingest started"
    );

    let mut events = Vec::new();
    for resource in &request.resources {
        if let Some(mut event) = evaluate(conn, user_id, resource, now) {
            event.scan_id = scan_id;
            event.insert(conn)?;
            events.push(event);
        }
    }

    if let Some(spend) = request.account_monthly_spend {
        let account_hash = anonymizer.hash_identifier(&request.cloud_account_id);
        let month = now.format("%Y-%m").to_string();
        AccountSpend::upsert(conn, &account_hash, &month, request.provider, spend)?;
    }

    let records_written =
        collector::collect(conn, anonymizer, scan_id, &events, &request.cloud_account_id)?;

    Ok(ScanOutcome {
        scan_id,
        detections: events.len(),
        records_written,
        skipped: request.resources.len() - events.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::models::{Confidence, MlTrainingRecord, RulePatch};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    fn resource(resource_id: &str, resource_type: &str, idle_days: i64) -> ResourceDescriptor {
        ResourceDescriptor {
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
            provider: Provider::Aws,
            region: "us-east-1".to_string(),
            state: "available".to_string(),
            created_at: now() - chrono::Duration::days(idle_days + 30),
            last_accessed_at: Some(now() - chrono::Duration::days(idle_days)),
            size_gb: Some(100.0),
            tags: BTreeMap::new(),
            metric_timeseries: vec![],
            estimated_monthly_cost: 45.20,
        }
    }

    fn request(resources: Vec<ResourceDescriptor>) -> ScanRequest {
        ScanRequest {
            scan_id: None,
            cloud_account_id: "acct-1".to_string(),
            provider: Provider::Aws,
            account_monthly_spend: None,
            resources,
        }
    }

    fn setup() -> (Db, Anonymizer) {
        let db = Db::open_in_memory().unwrap();
        db.with(|conn| rules::seed_defaults(conn)).unwrap();
        (db, Anonymizer::new("scan-test-salt").unwrap())
    }

    #[test]
    fn aged_volume_flows_through_to_a_critical_record() {
        let (db, anon) = setup();
        let outcome = db
            .with(|conn| {
                run_scan(
                    conn,
                    &anon,
                    "u1",
                    &request(vec![resource("vol-123", "ebs_volume", 95)]),
                    now(),
                )
            })
            .unwrap();

        assert_eq!(outcome.detections, 1);
        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.skipped, 0);

        db.with(|conn| {
            assert_eq!(DetectionEvent::count_for_scan(conn, outcome.scan_id)?, 1);
            let record =
                MlTrainingRecord::latest_for_hash(conn, &anon.hash_identifier("vol-123"))?.unwrap();
            assert_eq!(record.confidence_level, Confidence::Critical);
            assert_eq!(record.resource_age_days, 95);
            assert_eq!(record.cost_monthly, 45.20);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn disabled_rule_excludes_resource_entirely() {
        let (db, anon) = setup();
        db.with(|conn| {
            rules::update(
                conn,
                "ebs_volume",
                "u1",
                &RulePatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )?;
            let outcome = run_scan(
                conn,
                &anon,
                "u1",
                &request(vec![resource("vol-123", "ebs_volume", 95)]),
                now(),
            )?;
            assert_eq!(outcome.detections, 0);
            assert_eq!(outcome.skipped, 1);

            // Another user still detects it.
            let outcome = run_scan(
                conn,
                &anon,
                "u2",
                &request(vec![resource("vol-123", "ebs_volume", 95)]),
                now(),
            )?;
            assert_eq!(outcome.detections, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn young_resources_are_gated_by_min_age() {
        let (db, anon) = setup();
        db.with(|conn| {
            // ebs_volume default min_age_days = 7; creation age 5 here.
            let mut young = resource("vol-young", "ebs_volume", 2);
            young.created_at = now() - chrono::Duration::days(5);
            let outcome = run_scan(conn, &anon, "u1", &request(vec![young]), now())?;
            assert_eq!(outcome.detections, 0);
            assert_eq!(outcome.skipped, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unknown_resource_type_uses_fallback_instead_of_failing() {
        let (db, anon) = setup();
        db.with(|conn| {
            let outcome = run_scan(
                conn,
                &anon,
                "u1",
                &request(vec![resource("res-9", "quantum_widget", 40)]),
                now(),
            )?;
            assert_eq!(outcome.detections, 1);
            let record =
                MlTrainingRecord::latest_for_hash(conn, &anon.hash_identifier("res-9"))?.unwrap();
            // 40 idle days against fallback thresholds 90/30/7.
            assert_eq!(record.confidence_level, Confidence::High);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reported_spend_is_stored_for_the_month() {
        let (db, anon) = setup();
        db.with(|conn| {
            let mut req = request(vec![resource("vol-123", "ebs_volume", 95)]);
            req.account_monthly_spend = Some(1200.0);
            run_scan(conn, &anon, "u1", &req, now())?;

            let spend = AccountSpend::get(
                conn,
                &anon.hash_identifier("acct-1"),
                "2025-06",
                Provider::Aws,
            )?;
            assert_eq!(spend, Some(1200.0));
            Ok(())
        })
        .unwrap();
    }
}
