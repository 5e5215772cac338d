//! Energy integration over power samples.
//!
//! Energy is the area under the power curve, approximated with the
//! trapezoidal rule. Gaps longer than a configured maximum are clamped so
//! that an outage does not count as hours of consumption.

use crate::db::{DbError, Resolution, RollupBucket, Sample, Store};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, Utc};
use serde::Serialize;

/// Default gap clamp between two consecutive samples.
pub const DEFAULT_MAX_GAP_SECS: i64 = 120;

/// A power reading in watts at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerPoint {
    pub time: DateTime<Utc>,
    pub power: f64,
}

impl From<&Sample> for PowerPoint {
    fn from(s: &Sample) -> Self {
        Self {
            time: s.time,
            power: s.power,
        }
    }
}

/// Energy of the part of an hour bucket that falls inside `[start, end)`,
/// taking the bucket average as constant over the hour.
fn bucket_energy(bucket: &RollupBucket, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let bucket_end = bucket.bucket_start + ChronoDuration::seconds(bucket.resolution.seconds());
    let overlap_ms = (bucket_end.min(end) - bucket.bucket_start.max(start)).num_milliseconds();
    if overlap_ms <= 0 {
        return 0.0;
    }
    bucket.power_avg() / 1000.0 * (overlap_ms as f64 / 3_600_000.0)
}

/// Integrate an ordered power series into kWh.
///
/// Empty or single-point input yields zero. A pair whose timestamps do not
/// advance contributes nothing.
pub fn integrate_energy(points: &[PowerPoint], max_gap: ChronoDuration) -> f64 {
    let max_gap_ms = max_gap.num_milliseconds().max(0);

    points
        .windows(2)
        .map(|pair| {
            let dt_ms = (pair[1].time - pair[0].time).num_milliseconds();
            if dt_ms <= 0 {
                return 0.0;
            }
            let dt_hours = dt_ms.min(max_gap_ms) as f64 / 3_600_000.0;
            let avg_power = (pair[0].power + pair[1].power) / 2.0;
            avg_power / 1000.0 * dt_hours
        })
        .sum()
}

/// Energy consumed within `[start, end)` in kWh.
///
/// Raw samples only reach back as far as the sample retention horizon.
/// Anything older comes from hour buckets, each covering its full hour
/// clipped to the window. The stretch from the horizon to the first raw
/// sample is held at that sample's power, subject to the gap clamp.
pub fn energy_between(
    store: &Store,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    max_gap: ChronoDuration,
) -> Result<f64, DbError> {
    if end <= start {
        return Ok(0.0);
    }

    let boundary = Resolution::Hour
        .ceil(now - store.sample_retention())
        .clamp(start, end);

    let samples: Vec<PowerPoint> = store
        .get_samples(boundary, end)?
        .iter()
        .map(PowerPoint::from)
        .collect();

    let mut energy = integrate_energy(&samples, max_gap);

    if boundary > start {
        energy += store
            .get_buckets(Resolution::Hour, Resolution::Hour.truncate(start), boundary)?
            .iter()
            .map(|b| bucket_energy(b, start, boundary))
            .sum::<f64>();

        if let Some(first) = samples.first() {
            let lead_ms = (first.time - boundary)
                .num_milliseconds()
                .clamp(0, max_gap.num_milliseconds().max(0));
            energy += first.power / 1000.0 * (lead_ms as f64 / 3_600_000.0);
        }
    }

    Ok(energy)
}

/// Calendar windows reported side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodName {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
}

/// A named calendar window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Period {
    pub name: PeriodName,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Today, yesterday, this/last week (Monday start) and this/last month, in UTC.
pub fn comparison_periods(now: DateTime<Utc>) -> Vec<Period> {
    let today = Resolution::Day.truncate(now);
    let yesterday = today - ChronoDuration::days(1);

    let this_week = today - ChronoDuration::days(now.weekday().num_days_from_monday() as i64);
    let last_week = this_week - ChronoDuration::days(7);

    let this_month = today.with_day(1).unwrap_or(today);
    let last_month = this_month
        .checked_sub_months(Months::new(1))
        .unwrap_or(this_month);

    vec![
        Period { name: PeriodName::Today, start: today, end: now },
        Period { name: PeriodName::Yesterday, start: yesterday, end: today },
        Period { name: PeriodName::ThisWeek, start: this_week, end: now },
        Period { name: PeriodName::LastWeek, start: last_week, end: this_week },
        Period { name: PeriodName::ThisMonth, start: this_month, end: now },
        Period { name: PeriodName::LastMonth, start: last_month, end: this_month },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct EnergyComparison {
    pub today: f64,
    pub yesterday: f64,
    pub this_week: f64,
    pub last_week: f64,
    pub this_month: f64,
    pub last_month: f64,
    pub calculated_at: DateTime<Utc>,
}

/// Energy totals for each comparison period.
pub fn energy_comparison(
    store: &Store,
    now: DateTime<Utc>,
    max_gap: ChronoDuration,
) -> Result<EnergyComparison, DbError> {
    let mut totals = EnergyComparison {
        today: 0.0,
        yesterday: 0.0,
        this_week: 0.0,
        last_week: 0.0,
        this_month: 0.0,
        last_month: 0.0,
        calculated_at: now,
    };

    for period in comparison_periods(now) {
        let kwh = energy_between(store, period.start, period.end, now, max_gap)?;
        let slot = match period.name {
            PeriodName::Today => &mut totals.today,
            PeriodName::Yesterday => &mut totals.yesterday,
            PeriodName::ThisWeek => &mut totals.this_week,
            PeriodName::LastWeek => &mut totals.last_week,
            PeriodName::ThisMonth => &mut totals.this_month,
            PeriodName::LastMonth => &mut totals.last_month,
        };
        *slot = kwh;
    }

    Ok(totals)
}
