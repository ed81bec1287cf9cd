//! User action handler

use axum::{extract::State, Json};
use chrono::Utc;

use crate::logic::actions::{self, ActionOutcome, ActionRequest};
use crate::middleware::CallerIdentity;
use crate::{AppResult, AppState};

/// Record the caller's decision on a detected resource
pub async fn record(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(request): Json<ActionRequest>,
) -> AppResult<Json<ActionOutcome>> {
    let outcome = state.db.with(|conn| {
        actions::record_action(conn, &state.anonymizer, &caller.user_id, &request, Utc::now())
    })?;
    Ok(Json(outcome))
}
