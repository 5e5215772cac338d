//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single incoming telemetry measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub time: DateTime<Utc>,
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
}

/// A stored telemetry sample. At most one per minute-aligned period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Bucket width for rollups and series queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
}

impl Resolution {
    /// Width of one bucket in seconds.
    pub const fn seconds(self) -> i64 {
        match self {
            Resolution::Minute => 60,
            Resolution::Hour => 3_600,
            Resolution::Day => 86_400,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
        }
    }

    /// Index of the epoch-aligned period containing `dt`.
    pub fn period_of(self, dt: DateTime<Utc>) -> i64 {
        dt.timestamp().div_euclid(self.seconds())
    }

    /// Start of the period containing `dt`.
    pub fn truncate(self, dt: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to_window(dt, self.seconds())
    }

    /// Start of the first period that begins at or after `dt`.
    pub fn ceil(self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.truncate(dt);
        if start == dt {
            start
        } else {
            start + chrono::Duration::seconds(self.seconds())
        }
    }
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown resolution: {0}")]
pub struct UnknownResolution(pub String);

impl FromStr for Resolution {
    type Err = UnknownResolution;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Resolution::Minute),
            "hour" => Ok(Resolution::Hour),
            "day" => Ok(Resolution::Day),
            other => Err(UnknownResolution(other.to_string())),
        }
    }
}

/// A pre-aggregated sum+count record for one resolution-aligned period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupBucket {
    pub bucket_start: DateTime<Utc>,
    pub resolution: Resolution,
    pub power_sum: f64,
    pub voltage_sum: f64,
    pub current_sum: f64,
    pub count: i64,
}

impl RollupBucket {
    pub fn power_avg(&self) -> f64 {
        self.power_sum / self.count as f64
    }

    pub fn voltage_avg(&self) -> f64 {
        self.voltage_sum / self.count as f64
    }

    pub fn current_avg(&self) -> f64 {
        self.current_sum / self.count as f64
    }
}

/// A user-defined threshold rule.
///
/// Rules are written by the management surface, so `metric`, `condition`
/// and `actions` are kept in their stored text form and parsed when the
/// rule is evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub metric: String,
    pub condition: String,
    pub threshold: f64,
    pub cooldown_seconds: i64,
    pub active: bool,
    pub message: String,
    /// JSON array of action specs, e.g. `[{"type":"webhook","url":"..."}]`
    pub actions: String,
    pub triggered: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            metric: "power".to_string(),
            condition: "gt".to_string(),
            threshold: 0.0,
            cooldown_seconds: 300,
            active: true,
            message: String::new(),
            actions: "[]".to_string(),
            triggered: false,
            last_triggered_at: None,
            trigger_count: 0,
        }
    }
}

/// A record of one rule trigger. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: i64,
    pub alert_id: i64,
    pub alert_name: String,
    pub metric: String,
    pub condition: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub triggered_at: DateTime<Utc>,
    pub message: String,
    pub sample_snapshot: Sample,
}

/// The latest reading as seen by dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RecentReading {
    pub latest: Option<Sample>,
    /// Power of the latest sample if it is fresh, otherwise zero.
    pub recent_power: f64,
    pub avg_power_10m: f64,
}

/// Filter and page selection for alert history queries.
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub alert_id: Option<i64>,
    pub metric: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub skip: i64,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            alert_id: None,
            metric: None,
            start: None,
            end: None,
            limit: 100,
            skip: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub skip: i64,
    pub has_more: bool,
}

/// Trigger statistics for one rule name.
#[derive(Debug, Clone, Serialize)]
pub struct AlertStat {
    pub alert_name: String,
    pub count: i64,
    pub last_triggered: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub history: Vec<AlertEvent>,
    pub pagination: Pagination,
    pub stats: Vec<AlertStat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            Resolution::Minute.truncate(dt),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap()
        );
        assert_eq!(
            Resolution::Hour.truncate(dt),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Resolution::Day.truncate(dt),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            truncate_to_window(dt, 300),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_ceil_keeps_aligned_times() {
        let aligned = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(Resolution::Hour.ceil(aligned), aligned);
        assert_eq!(
            Resolution::Hour.ceil(aligned + chrono::Duration::seconds(1)),
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("hour".parse::<Resolution>(), Ok(Resolution::Hour));
        assert_eq!(Resolution::Day.to_string(), "day");
        assert!("week".parse::<Resolution>().is_err());
    }
}
