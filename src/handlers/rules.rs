//! Detection rule handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::logic::rules::{self, RuleView};
use crate::middleware::CallerIdentity;
use crate::models::{EffectiveRule, RulePatch};
use crate::{AppResult, AppState};

/// List all rules as the caller sees them, defaults alongside
pub async fn list(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> AppResult<Json<Vec<RuleView>>> {
    let views = state
        .db
        .with(|conn| rules::list_for_user(conn, &caller.user_id))?;
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub rules: RulePatch,
}

/// Apply a partial override for one resource type
pub async fn update(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(resource_type): Path<String>,
    Json(request): Json<UpdateRuleRequest>,
) -> AppResult<Json<EffectiveRule>> {
    let effective = state
        .db
        .with(|conn| rules::update(conn, &resource_type, &caller.user_id, &request.rules))?;
    Ok(Json(effective))
}

/// Remove the caller's override for one resource type
pub async fn reset(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(resource_type): Path<String>,
) -> AppResult<Json<Value>> {
    let (removed, effective) = state.db.with(|conn| {
        let removed = rules::reset(conn, &resource_type, &caller.user_id)?;
        let effective = rules::resolve_or_fallback(conn, &resource_type, &caller.user_id);
        Ok((removed, effective))
    })?;
    Ok(Json(json!({ "removed": removed, "effective": effective })))
}

/// Remove every override the caller has
pub async fn reset_all(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> AppResult<Json<Value>> {
    let removed = state
        .db
        .with(|conn| rules::reset_all(conn, &caller.user_id))?;
    Ok(Json(json!({ "removed": removed })))
}
