//! ML data collector
//!
//! Turns classified detection events into anonymized training rows plus
//! lifecycle log entries. Per-resource failures are logged and skipped;
//! one malformed resource must never abort collection for the rest of the
//! scan. All writes are append-only inserts, so scans for different
//! accounts can collect concurrently without coordination.

use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::logic::anonymize::{self, Anonymizer};
use crate::models::{
    DetectionEvent, LifecycleEvent, LifecycleEventType, MlTrainingRecord, ML_SCHEMA_VERSION,
};

/// Build the anonymized pair for one detection. Pure except for hashing.
fn build_record(
    anonymizer: &Anonymizer,
    account_hash: &str,
    event: &DetectionEvent,
) -> CoreResult<(MlTrainingRecord, LifecycleEvent)> {
    let resource_hash = anonymizer.hash_identifier(&event.resource_id);
    let metrics_summary = anonymize::summarize_metrics(&event.metrics)?;

    let record = MlTrainingRecord {
        id: 0,
        schema_version: ML_SCHEMA_VERSION,
        account_hash: account_hash.to_string(),
        resource_hash: resource_hash.clone(),
        resource_type: event.resource_type.clone(),
        provider: event.provider,
        region_anonymized: anonymize::generalize_region(&event.region),
        resource_age_days: event.age_days,
        detection_scenario: event.detection_scenario.clone(),
        confidence_level: event.confidence,
        metrics_summary,
        cost_monthly: event.estimated_monthly_cost,
        user_action: None,
        resource_config: anonymize::filter_config(event.size_gb, &event.tags),
        detected_at: event.detected_at,
    };

    let lifecycle = LifecycleEvent {
        resource_hash,
        event_type: LifecycleEventType::Detected,
        detail: json!({
            "scan_id": event.scan_id,
            "detection_scenario": event.detection_scenario,
            "confidence_level": event.confidence,
        }),
        occurred_at: event.detected_at,
    };

    Ok((record, lifecycle))
}

/// Collect a scan's detection events into the anonymized datasets.
/// Returns the number of training records written.
pub fn collect(
    conn: &mut Connection,
    anonymizer: &Anonymizer,
    scan_id: Uuid,
    events: &[DetectionEvent],
    cloud_account_id: &str,
) -> CoreResult<usize> {
    let account_hash = anonymizer.hash_identifier(cloud_account_id);
    let mut written = 0usize;

    for event in events {
        let pair = match build_record(anonymizer, &account_hash, event) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(
                    %scan_id,
                    resource_id = %event.resource_id,
                    resource_type = %event.resource_type,
                    error = %err,
                    "Skipping resource during collection"
                );
                continue;
            }
        };

        // Record + lifecycle entry commit together or not at all.
        let result = (|| -> CoreResult<()> {
            let sp = conn.savepoint()?;
            pair.0.insert(&sp)?;
            pair.1.insert(&sp)?;
            sp.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => written += 1,
            Err(err) => {
                tracing::warn!(
                    %scan_id,
                    resource_id = %event.resource_id,
                    error = %err,
                    "Failed to persist collection row, skipping resource"
                );
            }
        }
    }

    tracing::info!(%scan_id, written, total = events.len(), "Collection finished");
    Ok(written)
}
