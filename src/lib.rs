//! idlewatch - cloud waste detection core
//!
//! Detects idle and abandoned cloud resources with per-user tunable
//! confidence rules, and turns every detection and user decision into
//! anonymized datasets for offline model training.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         IDLEWATCH                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌────────────┐  ┌──────────────────────────┐ │
//! │  │  API     │  │ Detection  │  │  Aggregation             │ │
//! │  │  (Axum)  │  │ & Collect  │  │  (Background Pass)       │ │
//! │  └────┬─────┘  └─────┬──────┘  └────────────┬─────────────┘ │
//! │       └──────────────┼──────────────────────┘               │
//! │                      ▼                                      │
//! │               ┌─────────────┐                               │
//! │               │   SQLite    │                               │
//! │               └─────────────┘                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logic;
pub mod middleware;
pub mod models;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{AppError, AppResult};

use config::Config;
use db::Db;
use logic::aggregate::Aggregator;
use logic::anonymize::Anonymizer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Config,
    pub anonymizer: Arc<Anonymizer>,
    pub aggregator: Arc<Aggregator>,
}

impl AppState {
    pub fn new(db: Db, config: Config) -> Result<Self, config::ConfigError> {
        let anonymizer = Arc::new(Anonymizer::new(config.anonymization_salt.clone())?);
        let aggregator = Arc::new(Aggregator::new(std::time::Duration::from_millis(
            config.aggregation_lock_wait_ms,
        )));
        Ok(Self {
            db,
            config,
            anonymizer,
            aggregator,
        })
    }
}

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::check))
        // Detection rules
        .route("/api/v1/detection-rules", get(handlers::rules::list))
        .route("/api/v1/detection-rules", delete(handlers::rules::reset_all))
        .route(
            "/api/v1/detection-rules/:resource_type",
            put(handlers::rules::update),
        )
        .route(
            "/api/v1/detection-rules/:resource_type",
            delete(handlers::rules::reset),
        )
        // Scan ingest and user decisions
        .route("/api/v1/internal/scans", post(handlers::scans::ingest))
        .route("/api/v1/actions", post(handlers::actions::record))
        // Admin
        .route("/api/v1/admin/ml-stats", get(handlers::admin::ml_stats))
        .route("/api/v1/admin/ml-export", post(handlers::admin::ml_export))
        .route("/api/v1/admin/aggregate", post(handlers::admin::aggregate))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
