//! User action tracker
//!
//! Records the user's decision on a detected resource: one append-only
//! `UserActionPattern` row per decision event, plus a claim on at most one
//! training record. Both writes happen in a single transaction; the claim
//! itself is one conditional UPDATE, so two concurrent decisions cannot
//! both take the same null-action row.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::logic::anonymize::Anonymizer;
use crate::models::{MlTrainingRecord, UserAction, UserActionPattern};

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub resource_hash: String,
    pub action: UserAction,
    pub cloud_account_id: String,
}

#[derive(Debug, Serialize)]
pub struct ActionOutcome {
    /// Whether a training record's null action was claimed. False on a
    /// duplicate decision; that is policy, not an error.
    pub record_updated: bool,
    pub time_to_action_hours: f64,
}

pub fn record_action(
    conn: &mut Connection,
    anonymizer: &Anonymizer,
    user_id: &str,
    request: &ActionRequest,
    now: DateTime<Utc>,
) -> CoreResult<ActionOutcome> {
    let tx = conn.transaction()?;

    let latest = MlTrainingRecord::latest_for_hash(&tx, &request.resource_hash)?
        .ok_or_else(|| CoreError::UnknownResource(request.resource_hash.clone()))?;

    let minutes = (now - latest.detected_at).num_minutes().max(0);
    let time_to_action_hours = minutes as f64 / 60.0;
    let cost_saved_monthly = match request.action {
        UserAction::Deleted => latest.cost_monthly,
        UserAction::Ignored | UserAction::Kept => 0.0,
    };

    // Duplicate decisions append a second pattern row on purpose; the
    // lifecycle-log philosophy treats them as distinct events.
    UserActionPattern {
        user_hash: anonymizer.hash_identifier(user_id),
        account_hash: anonymizer.hash_identifier(&request.cloud_account_id),
        resource_hash: request.resource_hash.clone(),
        resource_type: latest.resource_type.clone(),
        detection_scenario: latest.detection_scenario.clone(),
        confidence_level: latest.confidence_level,
        action_taken: request.action,
        time_to_action_hours,
        cost_monthly: latest.cost_monthly,
        cost_saved_monthly,
        detected_at: latest.detected_at,
        action_at: now,
    }
    .insert(&tx)?;

    let updated =
        MlTrainingRecord::set_action_on_latest_null(&tx, &request.resource_hash, request.action)?;
    tx.commit()?;

    tracing::info!(
        resource_hash = %request.resource_hash,
        action = request.action.as_str(),
        record_updated = updated > 0,
        "User action recorded"
    );

    Ok(ActionOutcome {
        record_updated: updated > 0,
        time_to_action_hours,
    })
}
