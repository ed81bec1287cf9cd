//! Aggregation engine
//!
//! Recomputes monthly cost/waste rollups from the training records. Each
//! run rebuilds the `(account, month, provider)` rows from scratch, which
//! makes reruns idempotent regardless of when scans completed. A keyed
//! advisory lock with a bounded wait serializes concurrent runs for the
//! same account and month; the recompute never proceeds without it.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Condvar, Mutex};

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    AccountSpend, CostTrendRecord, MlTrainingRecord, UserAction, WasteCategory,
};

/// How many categories the rollup keeps
const TOP_CATEGORIES: usize = 5;

/// In-process advisory lock keyed by (account_hash, month)
struct KeyedLock {
    held: Mutex<HashSet<(String, String)>>,
    released: Condvar,
}

struct KeyGuard<'a> {
    owner: &'a KeyedLock,
    key: (String, String),
}

impl KeyedLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire the key or give up after `wait`
    fn acquire(&self, account_hash: &str, month: &str, wait: Duration) -> Option<KeyGuard<'_>> {
        let key = (account_hash.to_string(), month.to_string());
        let deadline = Instant::now() + wait;
        let mut held = self.held.lock();
        while held.contains(&key) {
            if self.released.wait_until(&mut held, deadline).timed_out() {
                return None;
            }
        }
        held.insert(key.clone());
        Some(KeyGuard { owner: self, key })
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.owner.held.lock();
        held.remove(&self.key);
        self.owner.released.notify_all();
    }
}

pub struct Aggregator {
    locks: KeyedLock,
    lock_wait: Duration,
}

/// Parse "YYYY-MM" into the month's [start, end) bounds
pub fn month_bounds(month: &str) -> CoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    let invalid = || CoreError::InvalidMonth(month.to_string());
    let (year_raw, month_raw) = month.split_once('-').ok_or_else(invalid)?;
    let year: i32 = year_raw.parse().map_err(|_| invalid())?;
    let month_num: u32 = month_raw.parse().map_err(|_| invalid())?;

    let start = NaiveDate::from_ymd_opt(year, month_num, 1).ok_or_else(invalid)?;
    let end = if month_num == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month_num + 1, 1)
    }
    .ok_or_else(invalid)?;

    Ok((
        start.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc(),
        end.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc(),
    ))
}

impl Aggregator {
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            locks: KeyedLock::new(),
            lock_wait,
        }
    }

    /// Recompute all rollup rows for an account-month. Returns the rows in
    /// provider order.
    pub fn aggregate_month(
        &self,
        db: &Db,
        account_hash: &str,
        month: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<CostTrendRecord>> {
        let (start, end) = month_bounds(month)?;

        let _guard = self
            .locks
            .acquire(account_hash, month, self.lock_wait)
            .ok_or_else(|| CoreError::AggregationRace {
                account: account_hash.to_string(),
                month: month.to_string(),
            })?;

        db.with(|conn| {
            let records = MlTrainingRecord::for_account_between(conn, account_hash, start, end)?;

            let mut by_provider: BTreeMap<_, Vec<&MlTrainingRecord>> = BTreeMap::new();
            for record in &records {
                by_provider.entry(record.provider).or_default().push(record);
            }

            let mut trends = Vec::with_capacity(by_provider.len());
            for (provider, rows) in by_provider {
                let waste_detected: f64 = rows.iter().map(|r| r.cost_monthly).sum();
                let waste_eliminated: f64 = rows
                    .iter()
                    .filter(|r| r.user_action == Some(UserAction::Deleted))
                    .map(|r| r.cost_monthly)
                    .sum();

                let mut categories: BTreeMap<String, f64> = BTreeMap::new();
                let mut regions: BTreeMap<String, f64> = BTreeMap::new();
                for row in &rows {
                    *categories.entry(row.resource_type.clone()).or_default() +=
                        row.cost_monthly;
                    *regions.entry(row.region_anonymized.clone()).or_default() +=
                        row.cost_monthly;
                }

                let mut top: Vec<WasteCategory> = categories
                    .into_iter()
                    .map(|(resource_type, cost_monthly)| WasteCategory {
                        resource_type,
                        cost_monthly,
                    })
                    .collect();
                // Highest cost first; names break ties so reruns sort identically.
                top.sort_by(|a, b| {
                    b.cost_monthly
                        .partial_cmp(&a.cost_monthly)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.resource_type.cmp(&b.resource_type))
                });
                top.truncate(TOP_CATEGORIES);

                let total_spend =
                    AccountSpend::get(conn, account_hash, month, provider)?.unwrap_or(0.0);
                let waste_percentage = if total_spend > 0.0 {
                    (waste_detected / total_spend * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                };

                let trend = CostTrendRecord {
                    account_hash: account_hash.to_string(),
                    month: month.to_string(),
                    provider,
                    total_spend,
                    waste_detected,
                    waste_eliminated,
                    waste_percentage,
                    top_waste_categories: top,
                    regional_breakdown: regions,
                    computed_at: now,
                };
                trend.upsert(conn)?;
                trends.push(trend);
            }

            tracing::info!(account_hash, month, providers = trends.len(), "Month aggregated");
            Ok(trends)
        })
    }

    /// One background sweep: re-aggregate the current month for every
    /// account that produced records since it began. A held lock means
    /// someone else is already doing the work, so the account is skipped
    /// and the next pass catches up.
    pub fn run_pass(&self, db: &Db, now: DateTime<Utc>) -> CoreResult<usize> {
        let month = now.format("%Y-%m").to_string();
        let (start, _) = month_bounds(&month)?;
        let accounts = db.with(|conn| Ok(MlTrainingRecord::accounts_since(conn, start)?))?;

        let mut aggregated = 0usize;
        for account_hash in accounts {
            match self.aggregate_month(db, &account_hash, &month, now) {
                Ok(_) => aggregated += 1,
                Err(CoreError::AggregationRace { .. }) => {
                    tracing::warn!(account_hash, month, "Aggregation pass skipped held account");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::anonymize::Anonymizer;
    use crate::logic::{actions, collector};
    use crate::models::{Confidence, DetectionEvent, Provider};
    use chrono::TimeZone;
    use std::collections::BTreeMap as Map;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 20, 0, 0, 0).unwrap()
    }

    fn event(resource_id: &str, resource_type: &str, cost: f64) -> DetectionEvent {
        DetectionEvent {
            scan_id: Uuid::nil(),
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
            provider: Provider::Aws,
            region: "us-east-1".to_string(),
            state: "available".to_string(),
            age_days: 95,
            size_gb: None,
            estimated_monthly_cost: cost,
            metrics: vec![],
            tags: Map::new(),
            confidence: Confidence::Critical,
            detection_scenario: "idle volume".to_string(),
            detected_at: Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap(),
        }
    }

    fn setup() -> (Db, Anonymizer, Aggregator, String) {
        let db = Db::open_in_memory().unwrap();
        let anon = Anonymizer::new("agg-test-salt").unwrap();
        let aggregator = Aggregator::new(Duration::from_millis(200));
        let account_hash = anon.hash_identifier("acct-1");
        (db, anon, aggregator, account_hash)
    }

    #[test]
    fn month_bounds_cover_year_boundary() {
        let (start, end) = month_bounds("2025-12").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert!(month_bounds("2025-13").is_err());
        assert!(month_bounds("junk").is_err());
    }

    #[test]
    fn rollup_sums_waste_and_ranks_categories() {
        let (db, anon, aggregator, account_hash) = setup();
        db.with(|conn| {
            collector::collect(
                conn,
                &anon,
                Uuid::nil(),
                &[
                    event("vol-1", "ebs_volume", 40.0),
                    event("vol-2", "ebs_volume", 20.0),
                    event("ip-1", "elastic_ip", 3.6),
                    event("snap-1", "snapshot", 10.0),
                ],
                "acct-1",
            )?;
            Ok(AccountSpend::upsert(conn, &anon.hash_identifier("acct-1"), "2025-06", Provider::Aws, 1000.0)?)
        })
        .unwrap();

        // Mark one volume deleted.
        db.with(|conn| {
            actions::record_action(
                conn,
                &anon,
                "u1",
                &actions::ActionRequest {
                    resource_hash: anon.hash_identifier("vol-1"),
                    action: UserAction::Deleted,
                    cloud_account_id: "acct-1".to_string(),
                },
                now(),
            )
        })
        .unwrap();

        let trends = aggregator
            .aggregate_month(&db, &account_hash, "2025-06", now())
            .unwrap();
        assert_eq!(trends.len(), 1);
        let trend = &trends[0];

        assert!((trend.waste_detected - 73.6).abs() < 1e-9);
        assert!((trend.waste_eliminated - 40.0).abs() < 1e-9);
        assert!((trend.waste_percentage - 7.36).abs() < 1e-9);
        assert_eq!(trend.top_waste_categories[0].resource_type, "ebs_volume");
        assert!((trend.top_waste_categories[0].cost_monthly - 60.0).abs() < 1e-9);
        assert_eq!(trend.regional_breakdown.get("us-*"), Some(&73.6));
    }

    #[test]
    fn zero_spend_means_zero_percentage() {
        let (db, anon, aggregator, account_hash) = setup();
        db.with(|conn| {
            collector::collect(conn, &anon, Uuid::nil(), &[event("vol-1", "ebs_volume", 40.0)], "acct-1")
        })
        .unwrap();

        let trends = aggregator
            .aggregate_month(&db, &account_hash, "2025-06", now())
            .unwrap();
        assert_eq!(trends[0].total_spend, 0.0);
        assert_eq!(trends[0].waste_percentage, 0.0);
    }

    #[test]
    fn rerun_with_no_new_data_is_idempotent() {
        let (db, anon, aggregator, account_hash) = setup();
        db.with(|conn| {
            collector::collect(
                conn,
                &anon,
                Uuid::nil(),
                &[event("vol-1", "ebs_volume", 40.0), event("ip-1", "elastic_ip", 3.6)],
                "acct-1",
            )
        })
        .unwrap();

        let computed_at = now();
        let first = aggregator
            .aggregate_month(&db, &account_hash, "2025-06", computed_at)
            .unwrap();
        let second = aggregator
            .aggregate_month(&db, &account_hash, "2025-06", computed_at)
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn records_outside_the_month_are_excluded() {
        let (db, anon, aggregator, account_hash) = setup();
        db.with(|conn| {
            let mut july = event("vol-july", "ebs_volume", 99.0);
            july.detected_at = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
            collector::collect(
                conn,
                &anon,
                Uuid::nil(),
                &[event("vol-1", "ebs_volume", 40.0), july],
                "acct-1",
            )
        })
        .unwrap();

        let trends = aggregator
            .aggregate_month(&db, &account_hash, "2025-06", now())
            .unwrap();
        assert!((trends[0].waste_detected - 40.0).abs() < 1e-9);
    }

    #[test]
    fn held_key_times_out_with_race_error() {
        let (db, _anon, aggregator, account_hash) = setup();

        let _held = aggregator
            .locks
            .acquire(&account_hash, "2025-06", Duration::from_millis(10))
            .unwrap();

        let err = aggregator
            .aggregate_month(&db, &account_hash, "2025-06", now())
            .unwrap_err();
        assert!(matches!(err, CoreError::AggregationRace { .. }));
    }

    #[test]
    fn key_release_unblocks_waiters() {
        let (db, anon, aggregator, account_hash) = setup();
        db.with(|conn| {
            collector::collect(conn, &anon, Uuid::nil(), &[event("vol-1", "ebs_volume", 40.0)], "acct-1")
        })
        .unwrap();

        {
            let _held = aggregator
                .locks
                .acquire(&account_hash, "2025-06", Duration::from_millis(10))
                .unwrap();
        } // released here

        assert!(aggregator
            .aggregate_month(&db, &account_hash, "2025-06", now())
            .is_ok());
    }

    #[test]
    fn pass_aggregates_every_active_account() {
        let (db, anon, aggregator, _) = setup();
        db.with(|conn| {
            collector::collect(conn, &anon, Uuid::nil(), &[event("vol-1", "ebs_volume", 40.0)], "acct-1")?;
            collector::collect(conn, &anon, Uuid::nil(), &[event("ip-9", "elastic_ip", 3.6)], "acct-2")
        })
        .unwrap();

        let aggregated = aggregator.run_pass(&db, now()).unwrap();
        assert_eq!(aggregated, 2);

        let row = db
            .with(|conn| {
                Ok(CostTrendRecord::find(
                    conn,
                    &anon.hash_identifier("acct-2"),
                    "2025-06",
                    Provider::Aws,
                )?)
            })
            .unwrap();
        assert!(row.is_some());
    }

    #[test]
    fn different_keys_do_not_contend() {
        let (_db, _anon, aggregator, account_hash) = setup();
        let _a = aggregator
            .locks
            .acquire(&account_hash, "2025-06", Duration::from_millis(10))
            .unwrap();
        // Same account, different month acquires immediately.
        assert!(aggregator
            .locks
            .acquire(&account_hash, "2025-07", Duration::from_millis(10))
            .is_some());
    }
}
