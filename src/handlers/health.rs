//! Health check handler

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{AppResult, AppState};

pub async fn check(State(state): State<AppState>) -> AppResult<Json<Value>> {
    // A trivial query proves the database file is reachable.
    state.db.with(|conn| {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    })?;

    Ok(Json(json!({
        "status": "healthy",
        "service": "idlewatch",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
