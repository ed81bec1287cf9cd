//! Admin handlers: dataset stats, exports, and on-demand aggregation

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::error::AppError;
use crate::logic::export::{self, ExportBatch, ExportFormat};
use crate::middleware::CallerIdentity;
use crate::models::{CostTrendRecord, MlStats};
use crate::{AppResult, AppState};

/// Dataset health counters
pub async fn ml_stats(
    State(state): State<AppState>,
    _caller: CallerIdentity,
) -> AppResult<Json<MlStats>> {
    let stats = state
        .db
        .with(|conn| Ok(MlStats::gather(conn, Utc::now())?))?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    /// Lookback window in days
    #[serde(default = "default_days")]
    pub days: i64,
    #[serde(default = "default_format")]
    pub output_format: String,
}

fn default_days() -> i64 {
    30
}

fn default_format() -> String {
    "json".to_string()
}

/// Export every dataset for the lookback window
pub async fn ml_export(
    State(state): State<AppState>,
    _caller: CallerIdentity,
    Query(params): Query<ExportParams>,
) -> AppResult<Json<ExportBatch>> {
    if params.days <= 0 {
        return Err(AppError::BadRequest("days must be positive".to_string()));
    }
    let format = ExportFormat::parse(&params.output_format).ok_or_else(|| {
        AppError::BadRequest(format!(
            "unknown output_format '{}', expected json or csv",
            params.output_format
        ))
    })?;

    let end = Utc::now();
    let start = end - Duration::days(params.days);
    let batch = state
        .db
        .with(|conn| Ok(export::export_all(conn, &state.config.export_dir, start, end, format)))?;
    Ok(Json(batch))
}

#[derive(Debug, Deserialize)]
pub struct AggregateRequest {
    pub cloud_account_id: String,
    /// "YYYY-MM"
    pub month: String,
}

/// Recompute the monthly rollups for one account-month
pub async fn aggregate(
    State(state): State<AppState>,
    _caller: CallerIdentity,
    Json(request): Json<AggregateRequest>,
) -> AppResult<Json<Vec<CostTrendRecord>>> {
    let account_hash = state.anonymizer.hash_identifier(&request.cloud_account_id);
    let trends =
        state
            .aggregator
            .aggregate_month(&state.db, &account_hash, &request.month, Utc::now())?;
    Ok(Json(trends))
}
