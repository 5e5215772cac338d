//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Samples younger than this count as the live reading.
const RECENT_WINDOW_SECS: i64 = 10;
/// Window for the short moving average shown next to the live reading.
const AVERAGE_WINDOW_SECS: i64 = 600;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Store lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

#[derive(Error, Debug)]
#[error("invalid timestamp: {0}")]
struct BadTimestamp(String);

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    sample_retention: ChronoDuration,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            sample_retention: ChronoDuration::days(1),
        };
        store.init()?;
        Ok(store)
    }

    /// Set how long raw samples survive after a newer write.
    pub fn with_sample_retention(mut self, retention: ChronoDuration) -> Self {
        self.sample_retention = retention;
        self
    }

    pub fn sample_retention(&self) -> ChronoDuration {
        self.sample_retention
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }

        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Samples ---

    /// Store one reading.
    ///
    /// A reading that lands in the same minute as the most recent sample is
    /// averaged pairwise into that sample instead of appended. Samples older
    /// than the retention horizon are dropped afterwards.
    pub fn record_sample(&self, reading: &Reading) -> Result<Sample, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let last = tx
            .query_row(
                "SELECT id, time, power, voltage, current FROM samples ORDER BY time DESC, id DESC LIMIT 1",
                [],
                sample_from_row,
            )
            .optional()?;

        let stored = match last {
            Some(last)
                if Resolution::Minute.period_of(last.time)
                    == Resolution::Minute.period_of(reading.time) =>
            {
                let merged = Sample {
                    id: last.id,
                    time: last.time.max(reading.time),
                    power: (last.power + reading.power) / 2.0,
                    voltage: (last.voltage + reading.voltage) / 2.0,
                    current: (last.current + reading.current) / 2.0,
                };
                tx.execute(
                    "UPDATE samples SET time = ?1, power = ?2, voltage = ?3, current = ?4 WHERE id = ?5",
                    params![
                        format_db_time(merged.time),
                        merged.power,
                        merged.voltage,
                        merged.current,
                        merged.id,
                    ],
                )?;
                merged
            }
            _ => {
                tx.execute(
                    "INSERT INTO samples (time, power, voltage, current) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        format_db_time(reading.time),
                        reading.power,
                        reading.voltage,
                        reading.current,
                    ],
                )?;
                Sample {
                    id: tx.last_insert_rowid(),
                    time: reading.time,
                    power: reading.power,
                    voltage: reading.voltage,
                    current: reading.current,
                }
            }
        };

        let cutoff = stored.time - self.sample_retention;
        let trimmed = tx.execute(
            "DELETE FROM samples WHERE time < ?1",
            params![format_db_time(cutoff)],
        )?;

        tx.commit()?;

        if trimmed > 0 {
            tracing::debug!(trimmed, "Dropped samples past retention");
        }

        Ok(stored)
    }

    /// Get the most recently stored sample.
    pub fn latest_sample(&self) -> Result<Option<Sample>, DbError> {
        let conn = self.conn()?;
        let sample = conn
            .query_row(
                "SELECT id, time, power, voltage, current FROM samples ORDER BY time DESC, id DESC LIMIT 1",
                [],
                sample_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    /// Get samples within `[start, end)`, oldest first.
    pub fn get_samples(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, time, power, voltage, current FROM samples
             WHERE time >= ?1 AND time < ?2 ORDER BY time ASC, id ASC",
        )?;

        let samples = stmt
            .query_map(
                params![format_db_time(start), format_db_time(end)],
                sample_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Latest sample plus the live value and 10 minute average derived from it.
    pub fn recent_reading(&self, now: DateTime<Utc>) -> Result<RecentReading, DbError> {
        let latest = self.latest_sample()?;

        let recent_power = match &latest {
            Some(s) if now - s.time < ChronoDuration::seconds(RECENT_WINDOW_SECS) => s.power,
            _ => 0.0,
        };

        let conn = self.conn()?;
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(power) FROM samples WHERE time >= ?1",
            params![format_db_time(
                now - ChronoDuration::seconds(AVERAGE_WINDOW_SECS)
            )],
            |row| row.get(0),
        )?;

        Ok(RecentReading {
            latest,
            recent_power,
            avg_power_10m: avg.unwrap_or(0.0),
        })
    }

    // --- Rollup Buckets ---

    /// Insert or wholesale replace buckets, matched on (bucket_start, resolution).
    pub fn upsert_buckets(&self, buckets: &[RollupBucket]) -> Result<(), DbError> {
        if buckets.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO rollup_buckets (bucket_start, resolution, power_sum, voltage_sum, current_sum, count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(bucket_start, resolution) DO UPDATE SET
                 power_sum=excluded.power_sum, voltage_sum=excluded.voltage_sum,
                 current_sum=excluded.current_sum, count=excluded.count",
            )?;

            for b in buckets {
                if b.count < 1 {
                    return Err(DbError::InvalidArgument(format!(
                        "bucket at {} has count {}",
                        b.bucket_start, b.count
                    )));
                }
                stmt.execute(params![
                    format_db_time(b.bucket_start),
                    b.resolution.as_str(),
                    b.power_sum,
                    b.voltage_sum,
                    b.current_sum,
                    b.count,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get buckets of one resolution whose start lies within `[start, end)`.
    pub fn get_buckets(
        &self,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupBucket>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bucket_start, power_sum, voltage_sum, current_sum, count
             FROM rollup_buckets
             WHERE resolution = ?1 AND bucket_start >= ?2 AND bucket_start < ?3
             ORDER BY bucket_start ASC",
        )?;

        let buckets = stmt
            .query_map(
                params![
                    resolution.as_str(),
                    format_db_time(start),
                    format_db_time(end),
                ],
                |row| {
                    Ok(RollupBucket {
                        bucket_start: time_column(row, 0)?,
                        resolution,
                        power_sum: row.get(1)?,
                        voltage_sum: row.get(2)?,
                        current_sum: row.get(3)?,
                        count: row.get(4)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(buckets)
    }

    /// Delete buckets of one resolution that start before a cutoff.
    pub fn delete_buckets_before(
        &self,
        resolution: Resolution,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM rollup_buckets WHERE resolution = ?1 AND bucket_start < ?2",
            params![resolution.as_str(), format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

pub(crate) fn sample_from_row(row: &Row<'_>) -> SqlResult<Sample> {
    Ok(Sample {
        id: row.get(0)?,
        time: time_column(row, 1)?,
        power: row.get(2)?,
        voltage: row.get(3)?,
        current: row.get(4)?,
    })
}

/// Read a timestamp column, failing the row on unparseable text.
pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(BadTimestamp(raw)))
    })
}

/// Format a datetime the way it is stored. Fixed width keeps text order
/// equal to time order.
pub(crate) fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    pub(crate) fn temp_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    pub(crate) fn reading(time: DateTime<Utc>, power: f64) -> Reading {
        Reading {
            time,
            power,
            voltage: 230.0,
            current: power / 230.0,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_same_minute_readings_merge_to_mean() {
        let (_tmp, store) = temp_store();

        store
            .record_sample(&Reading { time: at(12, 0, 5), power: 100.0, voltage: 220.0, current: 2.0 })
            .unwrap();
        let merged = store
            .record_sample(&Reading { time: at(12, 0, 40), power: 300.0, voltage: 230.0, current: 4.0 })
            .unwrap();

        let samples = store.get_samples(at(11, 0, 0), at(13, 0, 0)).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0], merged);
        assert_eq!(merged.power, 200.0);
        assert_eq!(merged.voltage, 225.0);
        assert_eq!(merged.current, 3.0);
        assert_eq!(merged.time, at(12, 0, 40));
    }

    #[test]
    fn test_merge_is_pairwise_not_running_mean() {
        let (_tmp, store) = temp_store();

        for (s, p) in [(1, 100.0), (2, 200.0), (3, 400.0)] {
            store.record_sample(&reading(at(12, 0, s), p)).unwrap();
        }

        let latest = store.latest_sample().unwrap().unwrap();
        // ((100 + 200) / 2 + 400) / 2
        assert_eq!(latest.power, 275.0);
    }

    #[test]
    fn test_new_minute_appends() {
        let (_tmp, store) = temp_store();

        store.record_sample(&reading(at(12, 0, 59), 100.0)).unwrap();
        store.record_sample(&reading(at(12, 1, 0), 200.0)).unwrap();

        let samples = store.get_samples(at(12, 0, 0), at(12, 2, 0)).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].power, 100.0);
        assert_eq!(samples[1].power, 200.0);
    }

    #[test]
    fn test_retention_trims_old_samples() {
        let (_tmp, store) = temp_store();
        let store = store.with_sample_retention(ChronoDuration::hours(1));

        store.record_sample(&reading(at(10, 0, 0), 100.0)).unwrap();
        store.record_sample(&reading(at(10, 30, 0), 150.0)).unwrap();
        store.record_sample(&reading(at(11, 15, 0), 200.0)).unwrap();

        let samples = store.get_samples(at(0, 0, 0), at(23, 0, 0)).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].time, at(10, 30, 0));
    }

    #[test]
    fn test_recent_reading() {
        let (_tmp, store) = temp_store();

        assert!(store.recent_reading(at(12, 0, 0)).unwrap().latest.is_none());

        store.record_sample(&reading(at(11, 55, 0), 100.0)).unwrap();
        store.record_sample(&reading(at(11, 59, 58), 300.0)).unwrap();

        let fresh = store.recent_reading(at(12, 0, 0)).unwrap();
        assert_eq!(fresh.recent_power, 300.0);
        assert_eq!(fresh.avg_power_10m, 200.0);

        let stale = store.recent_reading(at(12, 0, 30)).unwrap();
        assert_eq!(stale.recent_power, 0.0);
        assert!(stale.latest.is_some());
    }

    #[test]
    fn test_bucket_upsert_replaces() {
        let (_tmp, store) = temp_store();
        let mut bucket = RollupBucket {
            bucket_start: at(12, 0, 0),
            resolution: Resolution::Hour,
            power_sum: 10.0,
            voltage_sum: 20.0,
            current_sum: 30.0,
            count: 2,
        };

        store.upsert_buckets(&[bucket.clone()]).unwrap();
        bucket.power_sum = 99.0;
        bucket.count = 3;
        store.upsert_buckets(&[bucket.clone()]).unwrap();

        let buckets = store
            .get_buckets(Resolution::Hour, at(0, 0, 0), at(23, 0, 0))
            .unwrap();
        assert_eq!(buckets, vec![bucket]);
        assert_eq!(buckets[0].power_avg(), 33.0);

        let day = store
            .get_buckets(Resolution::Day, at(0, 0, 0), at(23, 0, 0))
            .unwrap();
        assert!(day.is_empty());
    }

    #[test]
    fn test_bucket_with_zero_count_rejected() {
        let (_tmp, store) = temp_store();
        let bucket = RollupBucket {
            bucket_start: at(12, 0, 0),
            resolution: Resolution::Hour,
            power_sum: 0.0,
            voltage_sum: 0.0,
            current_sum: 0.0,
            count: 0,
        };
        assert!(matches!(
            store.upsert_buckets(&[bucket]),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parse_db_time_formats() {
        let expected = at(12, 34, 56);
        assert_eq!(parse_db_time(&format_db_time(expected)), Some(expected));
        assert_eq!(parse_db_time("2024-03-01 12:34:56"), Some(expected));
        assert_eq!(parse_db_time("2024-03-01T12:34:56Z"), Some(expected));
        assert_eq!(parse_db_time("not a time"), None);
    }
}
