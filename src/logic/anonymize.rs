//! Anonymization service
//!
//! Pure, deterministic transformations that strip identifiable data while
//! keeping statistical utility for training. The salt is injected at
//! construction; nothing here reads ambient state, touches the database or
//! the network. Changing the salt invalidates cross-referencing of earlier
//! hashes on purpose.

use sha2::{Digest, Sha256};

use crate::config::ConfigError;
use crate::error::{CoreError, CoreResult};
use crate::models::{MetricSample, MetricsSummary, ResourceConfig, Trend};

/// Relative change in the first-third/last-third comparison that counts
/// as a direction. Deliberate policy values; tune together with
/// `VOLATILITY_COV` if at all.
const TREND_THRESHOLD: f64 = 0.15;

/// Coefficient of variation above which a series is volatile regardless
/// of direction.
const VOLATILITY_COV: f64 = 0.5;

/// Salted identifier hashing. One instance per process, built from config.
#[derive(Clone)]
pub struct Anonymizer {
    salt: String,
}

impl Anonymizer {
    pub fn new(salt: impl Into<String>) -> Result<Self, ConfigError> {
        let salt = salt.into();
        if salt.trim().is_empty() {
            return Err(ConfigError::MissingSalt);
        }
        Ok(Self { salt })
    }

    /// hex(SHA256(value || salt)). Deterministic, one-way, 64 hex chars.
    pub fn hash_identifier(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hasher.update(self.salt.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Geographic prefixes recognized across AWS, Azure, GCP and M365 region
/// naming. Anything else generalizes to `other-*`.
const GEO_PREFIXES: &[&str] = &[
    "us",
    "eu",
    "ap",
    "ca",
    "sa",
    "me",
    "af",
    "cn",
    "il",
    "uk",
    "europe",
    "asia",
    "australia",
    "northamerica",
    "southamerica",
    "global",
];

/// Strip a region string down to its geographic prefix: `us-east-1` →
/// `us-*`, `europe-west1` → `europe-*`, `westeurope` → `europe-*`.
/// Idempotent: generalizing an already generalized region is a no-op.
pub fn generalize_region(region: &str) -> String {
    let lower = region.trim().to_ascii_lowercase();
    let token = lower.split(['-', '_']).next().unwrap_or("");

    if GEO_PREFIXES.contains(&token) {
        return format!("{token}-*");
    }
    // Azure-style compact names put the geography after a compass word
    // ("westeurope", "eastus2"); match on either end of the token.
    if let Some(geo) = GEO_PREFIXES
        .iter()
        .find(|geo| token.starts_with(**geo) || token.trim_end_matches(char::is_numeric).ends_with(**geo))
    {
        return format!("{geo}-*");
    }
    "other-*".to_string()
}

/// Summarize a metric time series. Returns `None` for an empty series;
/// non-finite samples are a malformed input and rejected so the caller can
/// skip the offending resource.
pub fn summarize_metrics(samples: &[MetricSample]) -> CoreResult<Option<MetricsSummary>> {
    if samples.is_empty() {
        return Ok(None);
    }
    if samples.iter().any(|s| !s.value.is_finite()) {
        return Err(CoreError::BadMetrics(
            "non-finite value in metric series".to_string(),
        ));
    }

    // Sort by time so the trend comparison is independent of how the
    // scanner happened to order (or resample) the series.
    let mut ordered: Vec<MetricSample> = samples.to_vec();
    ordered.sort_by_key(|s| s.timestamp);
    let values: Vec<f64> = ordered.iter().map(|s| s.value).collect();

    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let avg = values.iter().sum::<f64>() / values.len() as f64;

    Ok(Some(MetricsSummary {
        avg,
        p50: percentile(&sorted, 0.50),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
        trend: trend_of(&values, avg),
    }))
}

/// Linear-interpolated percentile over a sorted slice
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = q * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

fn trend_of(values: &[f64], mean: f64) -> Trend {
    let n = values.len();
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let stdev = variance.sqrt();

    // Volatility wins over direction.
    let volatile = if mean.abs() < f64::EPSILON {
        stdev > f64::EPSILON
    } else {
        stdev / mean.abs() > VOLATILITY_COV
    };
    if volatile {
        return Trend::Volatile;
    }

    let third = (n / 3).max(1);
    let first = values[..third].iter().sum::<f64>() / third as f64;
    let last = values[n - third..].iter().sum::<f64>() / third as f64;

    if first.abs() < f64::EPSILON {
        return if last > f64::EPSILON {
            Trend::Increasing
        } else {
            Trend::Stable
        };
    }

    let relative = (last - first) / first.abs();
    if relative >= TREND_THRESHOLD {
        Trend::Increasing
    } else if relative <= -TREND_THRESHOLD {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Keys accepted from resource tags, grouped by the config field they
/// project onto. Everything else is dropped.
const TYPE_KEYS: &[&str] = &["instance_type", "sku", "type", "machine_type"];
const TIER_KEYS: &[&str] = &["performance_tier", "tier", "storage_class"];
const ENVIRONMENT_KEYS: &[&str] = &["environment", "env", "stage"];
const PURPOSE_KEYS: &[&str] = &["purpose", "role", "workload"];

/// Whitelist-based projection of a raw resource configuration
pub fn filter_config(
    size_gb: Option<f64>,
    tags: &std::collections::BTreeMap<String, String>,
) -> ResourceConfig {
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| tags.get(*key).cloned())
    };

    ResourceConfig {
        size_gb,
        instance_type: pick(TYPE_KEYS),
        performance_tier: pick(TIER_KEYS),
        environment: pick(ENVIRONMENT_KEYS),
        purpose: pick(PURPOSE_KEYS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn series(values: &[f64]) -> Vec<MetricSample> {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample {
                timestamp: base + chrono::Duration::hours(i as i64),
                value: *v,
            })
            .collect()
    }

    #[test]
    fn hash_is_deterministic_hex64() {
        let anon = Anonymizer::new("salt-a").unwrap();
        let first = anon.hash_identifier("vol-0123456789abcdef");
        let second = anon.hash_identifier("vol-0123456789abcdef");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_differs_across_values_and_salts() {
        let anon = Anonymizer::new("salt-a").unwrap();
        assert_ne!(anon.hash_identifier("vol-1"), anon.hash_identifier("vol-2"));

        let other = Anonymizer::new("salt-b").unwrap();
        assert_ne!(anon.hash_identifier("vol-1"), other.hash_identifier("vol-1"));
    }

    #[test]
    fn empty_salt_rejected() {
        assert!(Anonymizer::new("").is_err());
        assert!(Anonymizer::new("  ").is_err());
    }

    #[test]
    fn region_generalization() {
        assert_eq!(generalize_region("us-east-1"), "us-*");
        assert_eq!(generalize_region("eu-west-3"), "eu-*");
        assert_eq!(generalize_region("ap-southeast-1"), "ap-*");
        assert_eq!(generalize_region("europe-west1"), "europe-*");
        assert_eq!(generalize_region("westeurope"), "europe-*");
        assert_eq!(generalize_region("eastus2"), "us-*");
        assert_eq!(generalize_region("mars-north-1"), "other-*");
    }

    #[test]
    fn region_generalization_is_idempotent() {
        for region in [
            "us-east-1",
            "eu-west-3",
            "westeurope",
            "australiaeast",
            "somewhere-odd",
            "other-*",
        ] {
            let once = generalize_region(region);
            assert_eq!(generalize_region(&once), once, "region {region}");
        }
    }

    #[test]
    fn summary_of_flat_series_is_stable() {
        let summary = summarize_metrics(&series(&[10.0; 9])).unwrap().unwrap();
        assert_eq!(summary.avg, 10.0);
        assert_eq!(summary.p50, 10.0);
        assert_eq!(summary.p99, 10.0);
        assert_eq!(summary.trend, Trend::Stable);
    }

    #[test]
    fn rising_series_is_increasing() {
        let summary = summarize_metrics(&series(&[10.0, 10.0, 10.0, 11.0, 11.0, 11.0, 12.0, 12.0, 12.0]))
            .unwrap()
            .unwrap();
        assert_eq!(summary.trend, Trend::Increasing);
    }

    #[test]
    fn falling_series_is_decreasing() {
        let summary = summarize_metrics(&series(&[12.0, 12.0, 12.0, 11.0, 11.0, 11.0, 10.0, 10.0, 10.0]))
            .unwrap()
            .unwrap();
        assert_eq!(summary.trend, Trend::Decreasing);
    }

    #[test]
    fn high_variance_overrides_direction() {
        let summary = summarize_metrics(&series(&[1.0, 100.0, 2.0, 90.0, 1.0, 95.0, 3.0, 110.0, 2.0]))
            .unwrap()
            .unwrap();
        assert_eq!(summary.trend, Trend::Volatile);
    }

    #[test]
    fn trend_is_order_independent() {
        let ordered = series(&[10.0, 11.0, 12.0]);
        let mut shuffled = ordered.clone();
        shuffled.swap(0, 2);
        assert_eq!(
            summarize_metrics(&ordered).unwrap(),
            summarize_metrics(&shuffled).unwrap()
        );
    }

    #[test]
    fn non_finite_samples_rejected() {
        let mut samples = series(&[1.0, 2.0]);
        samples[1].value = f64::NAN;
        assert!(summarize_metrics(&samples).is_err());
    }

    #[test]
    fn percentiles_interpolate() {
        let summary = summarize_metrics(&series(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]))
            .unwrap()
            .unwrap();
        assert!((summary.p50 - 5.5).abs() < 1e-9);
        assert!((summary.p95 - 9.55).abs() < 1e-9);
    }

    #[test]
    fn config_whitelist_drops_unknown_fields() {
        let mut tags = std::collections::BTreeMap::new();
        tags.insert("instance_type".to_string(), "t3.large".to_string());
        tags.insert("environment".to_string(), "staging".to_string());
        tags.insert("owner_email".to_string(), "alice@example.com".to_string());
        tags.insert("internal_hostname".to_string(), "db-3.corp".to_string());

        let config = filter_config(Some(200.0), &tags);
        assert_eq!(config.size_gb, Some(200.0));
        assert_eq!(config.instance_type.as_deref(), Some("t3.large"));
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.purpose, None);

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("alice@example.com"));
        assert!(!json.contains("db-3.corp"));
    }
}
