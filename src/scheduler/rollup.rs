//! Rollup manager for aggregating samples into hour and day buckets.

use super::task::{PeriodicTask, RunFlag};
use crate::db::{DbError, Resolution, RollupBucket, Sample, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Number of buckets written by one rollup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupSummary {
    pub hour_buckets: usize,
    pub day_buckets: usize,
}

/// Manager for rolling up samples into hour buckets and hour buckets into
/// day buckets.
///
/// Every run recomputes its buckets from scratch and replaces what is
/// stored, so repeating a run over unchanged input changes nothing.
pub struct RollupManager {
    store: Arc<Store>,
    hour_retention: ChronoDuration,
    busy: RunFlag,
    task: PeriodicTask,
}

impl RollupManager {
    pub fn new(store: Arc<Store>, hour_retention: ChronoDuration, period: Duration) -> Self {
        Self {
            store,
            hour_retention,
            busy: RunFlag::default(),
            task: PeriodicTask::new("RollupManager", period),
        }
    }

    /// Start the rollup manager background task.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        self.task.start(move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.run(Utc::now()) {
                    tracing::error!("RollupManager: run failed, will recompute next time: {}", e);
                }
            }
        });
    }

    /// Stop the rollup manager, letting a run in progress finish.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Recompute hour and day buckets as of `now`.
    ///
    /// Returns `Ok(None)` without doing anything if another run is in
    /// progress.
    pub fn run(&self, now: DateTime<Utc>) -> Result<Option<RollupSummary>, DbError> {
        let Some(_guard) = self.busy.try_begin() else {
            tracing::debug!("RollupManager: previous run still in progress, skipping");
            return Ok(None);
        };

        // Hours older than this may already have lost samples to retention;
        // their stored buckets are final.
        let hour_from = Resolution::Hour.ceil(now - self.store.sample_retention());
        let hour_end = Resolution::Hour.truncate(now) + ChronoDuration::seconds(Resolution::Hour.seconds());
        let samples = self.store.get_samples(hour_from, hour_end)?;
        let hours = aggregate_samples(&samples, Resolution::Hour);
        self.store.upsert_buckets(&hours)?;

        let day_from = Resolution::Day.ceil(now - self.hour_retention);
        let day_end = Resolution::Day.truncate(now) + ChronoDuration::seconds(Resolution::Day.seconds());
        let hour_buckets = self.store.get_buckets(Resolution::Hour, day_from, day_end)?;
        let days = aggregate_buckets(&hour_buckets, Resolution::Day);
        self.store.upsert_buckets(&days)?;

        tracing::info!(
            "RollupManager: Aggregated {} samples into {} hour buckets, {} hour buckets into {} day buckets",
            samples.len(),
            hours.len(),
            hour_buckets.len(),
            days.len()
        );

        Ok(Some(RollupSummary {
            hour_buckets: hours.len(),
            day_buckets: days.len(),
        }))
    }
}

/// Group samples into buckets of the given resolution.
pub fn aggregate_samples(samples: &[Sample], resolution: Resolution) -> Vec<RollupBucket> {
    group(
        samples
            .iter()
            .map(|s| (s.time, s.power, s.voltage, s.current, 1)),
        resolution,
    )
}

/// Merge finer buckets into buckets of a coarser resolution.
pub fn aggregate_buckets(buckets: &[RollupBucket], resolution: Resolution) -> Vec<RollupBucket> {
    group(
        buckets.iter().map(|b| {
            (
                b.bucket_start,
                b.power_sum,
                b.voltage_sum,
                b.current_sum,
                b.count,
            )
        }),
        resolution,
    )
}

fn group<I>(rows: I, resolution: Resolution) -> Vec<RollupBucket>
where
    I: Iterator<Item = (DateTime<Utc>, f64, f64, f64, i64)>,
{
    let mut buckets: BTreeMap<DateTime<Utc>, RollupBucket> = BTreeMap::new();

    for (time, power, voltage, current, count) in rows {
        let start = resolution.truncate(time);
        let bucket = buckets.entry(start).or_insert_with(|| RollupBucket {
            bucket_start: start,
            resolution,
            power_sum: 0.0,
            voltage_sum: 0.0,
            current_sum: 0.0,
            count: 0,
        });
        bucket.power_sum += power;
        bucket.voltage_sum += voltage;
        bucket.current_sum += current;
        bucket.count += count;
    }

    buckets.into_values().filter(|b| b.count > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;
    use crate::db::Reading;
    use chrono::TimeZone;

    fn manager(store: Store) -> RollupManager {
        RollupManager::new(
            Arc::new(store),
            ChronoDuration::days(90),
            Duration::from_secs(60),
        )
    }

    fn seed(store: &Store, start: DateTime<Utc>, minutes: i64) {
        for i in 0..minutes {
            let t = start + ChronoDuration::minutes(i);
            store
                .record_sample(&Reading {
                    time: t,
                    power: 1000.0 + (i % 7) as f64 * 13.7,
                    voltage: 229.3 + (i % 3) as f64 * 0.1,
                    current: 4.1 + (i % 5) as f64 * 0.03,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_aggregate_samples_groups_by_hour() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let sample = |min: i64, power: f64| Sample {
            id: 0,
            time: base + ChronoDuration::minutes(min),
            power,
            voltage: 230.0,
            current: 1.0,
        };
        let samples = vec![sample(5, 100.0), sample(59, 300.0), sample(61, 500.0)];

        let buckets = aggregate_samples(&samples, Resolution::Hour);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, base);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].power_avg(), 200.0);
        assert_eq!(buckets[1].bucket_start, base + ChronoDuration::hours(1));
        assert_eq!(buckets[1].power_sum, 500.0);
    }

    #[test]
    fn test_day_buckets_sum_hour_buckets() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let hour = |h: i64, power_sum: f64, count: i64| RollupBucket {
            bucket_start: base + ChronoDuration::hours(h),
            resolution: Resolution::Hour,
            power_sum,
            voltage_sum: 230.0 * count as f64,
            current_sum: count as f64,
            count,
        };
        let hours = vec![hour(1, 6000.0, 60), hour(2, 3000.0, 30), hour(25, 100.0, 1)];

        let days = aggregate_buckets(&hours, Resolution::Day);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].bucket_start, base);
        assert_eq!(days[0].count, 90);
        assert_eq!(days[0].power_sum, 9000.0);
        assert_eq!(days[0].power_avg(), 100.0);
        assert_eq!(days[1].count, 1);
    }

    #[test]
    fn test_run_is_idempotent() {
        let (_tmp, store) = temp_store();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        seed(&store, start, 180);
        let now = start + ChronoDuration::hours(3);
        let range = (start - ChronoDuration::days(1), now + ChronoDuration::days(1));

        let manager = manager(store.clone());
        let first = manager.run(now).unwrap().unwrap();
        let hours_1 = store.get_buckets(Resolution::Hour, range.0, range.1).unwrap();
        let days_1 = store.get_buckets(Resolution::Day, range.0, range.1).unwrap();

        let second = manager.run(now).unwrap().unwrap();
        let hours_2 = store.get_buckets(Resolution::Hour, range.0, range.1).unwrap();
        let days_2 = store.get_buckets(Resolution::Day, range.0, range.1).unwrap();

        assert_eq!(first, second);
        assert_eq!(hours_1.len(), 3);
        assert_eq!(days_1.len(), 2);
        for (a, b) in hours_1.iter().zip(&hours_2).chain(days_1.iter().zip(&days_2)) {
            assert_eq!(a.bucket_start, b.bucket_start);
            assert_eq!(a.count, b.count);
            assert_eq!(a.power_sum.to_bits(), b.power_sum.to_bits());
            assert_eq!(a.voltage_sum.to_bits(), b.voltage_sum.to_bits());
            assert_eq!(a.current_sum.to_bits(), b.current_sum.to_bits());
        }

        let total: i64 = days_2.iter().map(|d| d.count).sum();
        assert_eq!(total, 180);
    }

    #[test]
    fn test_run_leaves_trimmed_hours_alone() {
        let (_tmp, store) = temp_store();
        let store = store.with_sample_retention(ChronoDuration::hours(2));
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        seed(&store, start, 60);

        let manager = manager(store.clone());
        manager.run(start + ChronoDuration::minutes(59)).unwrap();

        // Later samples push the 10:00 hour partly out of retention.
        seed(&store, start + ChronoDuration::minutes(150), 30);
        manager.run(start + ChronoDuration::minutes(180)).unwrap();

        let hours = store
            .get_buckets(Resolution::Hour, start, start + ChronoDuration::hours(4))
            .unwrap();
        assert_eq!(hours[0].bucket_start, start);
        assert_eq!(hours[0].count, 60);
    }

    #[test]
    fn test_overlapping_run_is_skipped() {
        let (_tmp, store) = temp_store();
        let manager = manager(store);

        let _held = manager.busy.try_begin().unwrap();
        assert_eq!(manager.run(Utc::now()).unwrap(), None);
    }
}
