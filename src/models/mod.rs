//! Data model - row types and their queries

pub mod record;
pub mod resource;
pub mod rule;

pub use record::{
    AccountSpend, CostTrendRecord, LifecycleEvent, LifecycleEventType, MetricsSummary, MlStats,
    MlTrainingRecord, ResourceConfig, Trend, UserAction, UserActionPattern, WasteCategory,
    ML_SCHEMA_VERSION,
};
pub use resource::{Confidence, DetectionEvent, MetricSample, Provider, ResourceDescriptor};
pub use rule::{DetectionRule, EffectiveRule, RulePatch, DEFAULT_SCOPE};
