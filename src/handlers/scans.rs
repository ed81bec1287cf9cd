//! Scan ingest handler

use axum::{extract::State, Json};
use chrono::Utc;

use crate::logic::scan::{self, ScanOutcome, ScanRequest};
use crate::middleware::CallerIdentity;
use crate::{AppResult, AppState};

/// Ingest one scanner delivery for the calling user's account
pub async fn ingest(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(request): Json<ScanRequest>,
) -> AppResult<Json<ScanOutcome>> {
    let outcome = state.db.with(|conn| {
        scan::run_scan(conn, &state.anonymizer, &caller.user_id, &request, Utc::now())
    })?;
    Ok(Json(outcome))
}
