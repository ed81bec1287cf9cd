//! Confidence classifier
//!
//! Maps resource idle age onto a confidence tier using the resolved rule's
//! three thresholds. Tiers are right-open intervals with inclusive lower
//! bounds, so a boundary age lands in the higher tier.

use once_cell::sync::Lazy;

use crate::models::{Confidence, EffectiveRule};

/// Hard-coded minimal rule for resource types nothing was ever configured
/// for. Falling back keeps an unknown type from failing the whole scan.
static FALLBACK_THRESHOLDS: Lazy<EffectiveRule> = Lazy::new(|| EffectiveRule {
    resource_type: String::new(),
    enabled: true,
    min_age_days: None,
    min_stopped_days: None,
    confidence_critical_days: 90,
    confidence_high_days: 30,
    confidence_medium_days: 7,
});

pub fn fallback_rule(resource_type: &str) -> EffectiveRule {
    EffectiveRule {
        resource_type: resource_type.to_string(),
        ..FALLBACK_THRESHOLDS.clone()
    }
}

/// Classify an idle age against a rule's thresholds
pub fn classify(age_days: i64, rule: &EffectiveRule) -> Confidence {
    if age_days >= rule.confidence_critical_days {
        Confidence::Critical
    } else if age_days >= rule.confidence_high_days {
        Confidence::High
    } else if age_days >= rule.confidence_medium_days {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Name the waste pattern a detection matched. The label feeds the
/// anonymized datasets, so it must not carry identifiable detail.
pub fn scenario_for(resource_type: &str, state: &str) -> String {
    let scenario = match resource_type {
        "ebs_volume" | "managed_disk" | "persistent_disk" => "idle volume",
        "ec2_instance" | "stopped_vm" if state == "stopped" => "stopped instance",
        "ec2_instance" | "idle_vm_instance" => "idle instance",
        "elastic_ip" => "unassociated address",
        "snapshot" | "disk_snapshot" => "orphaned snapshot",
        "sharepoint_site" => "abandoned site",
        "load_balancer" => "idle load balancer",
        _ => "idle resource",
    };
    scenario.to_string()
}
