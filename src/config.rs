//! Configuration module for Wattrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the query API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "wattrail.db")
    pub db_path: String,
    /// How long raw samples are kept (default: 1 day)
    pub sample_retention_secs: i64,
    /// How long hour buckets are kept (default: 90 days)
    pub hour_retention_secs: i64,
    /// How long day buckets are kept (default: 10 years)
    pub day_retention_secs: i64,
    /// Alert evaluator tick period (default: 5s)
    pub alert_interval_secs: u64,
    /// Rollup aggregator period (default: 60s)
    pub rollup_interval_secs: u64,
    /// Bucket retention sweep period (default: 300s)
    pub retention_interval_secs: u64,
    /// Upper bound on a single alert action (default: 10s)
    pub action_timeout_secs: u64,
    /// Largest gap between samples counted by the energy integrator (default: 120s)
    pub max_energy_gap_secs: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "wattrail.db".to_string(),
            sample_retention_secs: 86_400,
            hour_retention_secs: 7_776_000,
            day_retention_secs: 315_360_000,
            alert_interval_secs: 5,
            rollup_interval_secs: 60,
            retention_interval_secs: 300,
            action_timeout_secs: 10,
            max_energy_gap_secs: crate::energy::DEFAULT_MAX_GAP_SECS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WATTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `WATTRAIL_DB_PATH`: Database file path (default: "wattrail.db")
    /// - `WATTRAIL_SAMPLE_RETENTION_SECS`, `WATTRAIL_HOUR_RETENTION_SECS`,
    ///   `WATTRAIL_DAY_RETENTION_SECS`: retention horizons
    /// - `WATTRAIL_ALERT_INTERVAL_SECS`, `WATTRAIL_ROLLUP_INTERVAL_SECS`,
    ///   `WATTRAIL_RETENTION_INTERVAL_SECS`: task periods
    /// - `WATTRAIL_ACTION_TIMEOUT_SECS`: per-action timeout
    /// - `WATTRAIL_MAX_ENERGY_GAP_SECS`: energy integration gap clamp
    ///
    /// Values that fail to parse, or are zero, keep their defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = positive_var("WATTRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("WATTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        override_with(&mut cfg.sample_retention_secs, "WATTRAIL_SAMPLE_RETENTION_SECS");
        override_with(&mut cfg.hour_retention_secs, "WATTRAIL_HOUR_RETENTION_SECS");
        override_with(&mut cfg.day_retention_secs, "WATTRAIL_DAY_RETENTION_SECS");
        override_with(&mut cfg.alert_interval_secs, "WATTRAIL_ALERT_INTERVAL_SECS");
        override_with(&mut cfg.rollup_interval_secs, "WATTRAIL_ROLLUP_INTERVAL_SECS");
        override_with(&mut cfg.retention_interval_secs, "WATTRAIL_RETENTION_INTERVAL_SECS");
        override_with(&mut cfg.action_timeout_secs, "WATTRAIL_ACTION_TIMEOUT_SECS");
        override_with(&mut cfg.max_energy_gap_secs, "WATTRAIL_MAX_ENERGY_GAP_SECS");

        cfg
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_secs(self.alert_interval_secs)
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

fn override_with<T>(field: &mut T, key: &str)
where
    T: FromStr + PartialOrd + Default,
{
    if let Some(value) = positive_var(key) {
        *field = value;
    }
}

fn positive_var<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    parse_positive(&env::var(key).ok()?)
}

fn parse_positive<T>(raw: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    raw.trim().parse::<T>().ok().filter(|v| *v > T::default())
}
