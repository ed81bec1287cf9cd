//! Detection rules resolver
//!
//! Defaults are seeded once per resource type; users override individual
//! fields. Resolution merges field-by-field: an override field wins only if
//! it was explicitly set. Updates are validated against the *merged* result
//! so a partial patch can never smuggle in an inconsistent threshold order.

use rusqlite::Connection;

use crate::error::{CoreError, CoreResult};
use crate::logic::classify;
use crate::models::{DetectionRule, EffectiveRule, RulePatch, DEFAULT_SCOPE};

struct DefaultRuleSeed {
    resource_type: &'static str,
    min_age_days: Option<i64>,
    min_stopped_days: Option<i64>,
    critical: i64,
    high: i64,
    medium: i64,
    description: &'static str,
}

/// System-wide defaults for every resource type the provider scanners emit
const DEFAULT_RULES: &[DefaultRuleSeed] = &[
    DefaultRuleSeed {
        resource_type: "ebs_volume",
        min_age_days: Some(7),
        min_stopped_days: None,
        critical: 90,
        high: 30,
        medium: 7,
        description: "Unattached or idle EBS volumes",
    },
    DefaultRuleSeed {
        resource_type: "ec2_instance",
        min_age_days: Some(14),
        min_stopped_days: Some(7),
        critical: 90,
        high: 30,
        medium: 14,
        description: "Stopped or idle EC2 instances",
    },
    DefaultRuleSeed {
        resource_type: "elastic_ip",
        min_age_days: Some(3),
        min_stopped_days: None,
        critical: 60,
        high: 14,
        medium: 3,
        description: "Unassociated Elastic IP addresses",
    },
    DefaultRuleSeed {
        resource_type: "snapshot",
        min_age_days: Some(30),
        min_stopped_days: None,
        critical: 365,
        high: 180,
        medium: 90,
        description: "Orphaned EBS snapshots",
    },
    DefaultRuleSeed {
        resource_type: "managed_disk",
        min_age_days: Some(7),
        min_stopped_days: None,
        critical: 90,
        high: 30,
        medium: 7,
        description: "Unattached Azure managed disks",
    },
    DefaultRuleSeed {
        resource_type: "stopped_vm",
        min_age_days: Some(14),
        min_stopped_days: Some(7),
        critical: 90,
        high: 30,
        medium: 14,
        description: "Deallocated Azure virtual machines",
    },
    DefaultRuleSeed {
        resource_type: "persistent_disk",
        min_age_days: Some(7),
        min_stopped_days: None,
        critical: 90,
        high: 30,
        medium: 7,
        description: "Unattached GCP persistent disks",
    },
    DefaultRuleSeed {
        resource_type: "idle_vm_instance",
        min_age_days: Some(14),
        min_stopped_days: None,
        critical: 60,
        high: 21,
        medium: 7,
        description: "GCP instances with negligible utilization",
    },
    DefaultRuleSeed {
        resource_type: "sharepoint_site",
        min_age_days: Some(30),
        min_stopped_days: None,
        critical: 365,
        high: 180,
        medium: 60,
        description: "SharePoint sites without recent activity",
    },
];

/// Seed default rules for all supported resource types. Idempotent; an
/// existing default row is left untouched.
pub fn seed_defaults(conn: &Connection) -> CoreResult<()> {
    for seed in DEFAULT_RULES {
        DetectionRule::seed_default(
            conn,
            seed.resource_type,
            true,
            seed.min_age_days,
            seed.min_stopped_days,
            seed.critical,
            seed.high,
            seed.medium,
            seed.description,
        )?;
    }
    tracing::debug!(count = DEFAULT_RULES.len(), "Default detection rules seeded");
    Ok(())
}

fn validate(critical: i64, high: i64, medium: i64) -> CoreResult<()> {
    if critical >= high && high >= medium && medium >= 0 {
        Ok(())
    } else {
        Err(CoreError::RuleValidation {
            critical,
            high,
            medium,
        })
    }
}

/// Merge a default row with an optional override row. Only non-NULL
/// override fields win.
fn merge(default: &DetectionRule, override_row: Option<&DetectionRule>) -> CoreResult<EffectiveRule> {
    let missing = || CoreError::MissingDefaultRule(default.resource_type.clone());
    let critical = default.confidence_critical_days.ok_or_else(missing)?;
    let high = default.confidence_high_days.ok_or_else(missing)?;
    let medium = default.confidence_medium_days.ok_or_else(missing)?;

    let mut rule = EffectiveRule {
        resource_type: default.resource_type.clone(),
        enabled: default.enabled.unwrap_or(true),
        min_age_days: default.min_age_days,
        min_stopped_days: default.min_stopped_days,
        confidence_critical_days: critical,
        confidence_high_days: high,
        confidence_medium_days: medium,
    };

    if let Some(over) = override_row {
        if let Some(enabled) = over.enabled {
            rule.enabled = enabled;
        }
        if over.min_age_days.is_some() {
            rule.min_age_days = over.min_age_days;
        }
        if over.min_stopped_days.is_some() {
            rule.min_stopped_days = over.min_stopped_days;
        }
        if let Some(v) = over.confidence_critical_days {
            rule.confidence_critical_days = v;
        }
        if let Some(v) = over.confidence_high_days {
            rule.confidence_high_days = v;
        }
        if let Some(v) = over.confidence_medium_days {
            rule.confidence_medium_days = v;
        }
    }
    Ok(rule)
}

/// Resolve the effective rule for a (resource_type, user) pair. A missing
/// default is a configuration error, not a fallback case.
pub fn resolve(conn: &Connection, resource_type: &str, user_id: &str) -> CoreResult<EffectiveRule> {
    let default = DetectionRule::find(conn, resource_type, DEFAULT_SCOPE)?
        .ok_or_else(|| CoreError::MissingDefaultRule(resource_type.to_string()))?;
    let override_row = DetectionRule::find(conn, resource_type, user_id)?;
    merge(&default, override_row.as_ref())
}

/// Resolution used inside a scan: a resource type nobody configured gets
/// the hard-coded fallback instead of failing the scan.
pub fn resolve_or_fallback(conn: &Connection, resource_type: &str, user_id: &str) -> EffectiveRule {
    match resolve(conn, resource_type, user_id) {
        Ok(rule) => rule,
        Err(CoreError::MissingDefaultRule(_)) => {
            tracing::debug!(resource_type, "No default rule, using fallback thresholds");
            classify::fallback_rule(resource_type)
        }
        Err(err) => {
            tracing::warn!(resource_type, error = %err, "Rule resolution failed, using fallback");
            classify::fallback_rule(resource_type)
        }
    }
}

/// Apply a user patch. The merged result is validated *before* anything is
/// written, so a rejected patch leaves the stored override unchanged.
pub fn update(
    conn: &Connection,
    resource_type: &str,
    user_id: &str,
    patch: &RulePatch,
) -> CoreResult<EffectiveRule> {
    let default = DetectionRule::find(conn, resource_type, DEFAULT_SCOPE)?
        .ok_or_else(|| CoreError::MissingDefaultRule(resource_type.to_string()))?;
    let existing = DetectionRule::find(conn, resource_type, user_id)?;
    let current = merge(&default, existing.as_ref())?;

    let candidate_critical = patch
        .confidence_critical_days
        .unwrap_or(current.confidence_critical_days);
    let candidate_high = patch
        .confidence_high_days
        .unwrap_or(current.confidence_high_days);
    let candidate_medium = patch
        .confidence_medium_days
        .unwrap_or(current.confidence_medium_days);
    validate(candidate_critical, candidate_high, candidate_medium)?;

    if !patch.is_empty() {
        DetectionRule::upsert_override(conn, resource_type, user_id, patch)?;
    }
    resolve(conn, resource_type, user_id)
}

/// Remove one override; reverts the user to defaults. Idempotent.
pub fn reset(conn: &Connection, resource_type: &str, user_id: &str) -> CoreResult<bool> {
    Ok(DetectionRule::delete_override(conn, resource_type, user_id)?)
}

/// Remove every override for the user. Idempotent.
pub fn reset_all(conn: &Connection, user_id: &str) -> CoreResult<usize> {
    Ok(DetectionRule::delete_all_overrides(conn, user_id)?)
}

/// One entry of the rules listing: the caller's effective view next to the
/// system default.
#[derive(Debug, serde::Serialize)]
pub struct RuleView {
    pub resource_type: String,
    pub current_rules: EffectiveRule,
    pub default_rules: EffectiveRule,
    pub description: Option<String>,
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> CoreResult<Vec<RuleView>> {
    let defaults = DetectionRule::list_defaults(conn)?;
    let mut views = Vec::with_capacity(defaults.len());
    for default in defaults {
        let override_row = DetectionRule::find(conn, &default.resource_type, user_id)?;
        views.push(RuleView {
            resource_type: default.resource_type.clone(),
            current_rules: merge(&default, override_row.as_ref())?,
            default_rules: merge(&default, None)?,
            description: default.description.clone(),
        });
    }
    Ok(views)
}
