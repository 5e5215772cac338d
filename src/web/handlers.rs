//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, HistoryFilter, Resolution, Sample};
use crate::energy::{energy_between, energy_comparison};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Helpers
// ============================================================================

/// Parse an optional RFC 3339 query value, answering 400 if it is malformed.
fn parse_time(value: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, Response> {
    match value.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid {name} timestamp")).into_response()),
    }
}

/// Resolve a `[start, end)` range, defaulting to the `default_span` before now.
fn parse_range(
    start: Option<&str>,
    end: Option<&str>,
    default_span: ChronoDuration,
) -> Result<(DateTime<Utc>, DateTime<Utc>), Response> {
    let end = parse_time(end, "end")?.unwrap_or_else(Utc::now);
    let start = parse_time(start, "start")?.unwrap_or(end - default_span);

    if end <= start {
        return Err((StatusCode::BAD_REQUEST, "end must be after start").into_response());
    }
    Ok((start, end))
}

fn db_error(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        DbError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        e => {
            tracing::error!("Request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Pick the finest resolution that keeps a range to a plottable size.
fn select_resolution(duration: ChronoDuration) -> Resolution {
    if duration <= ChronoDuration::hours(6) {
        Resolution::Minute
    } else if duration <= ChronoDuration::days(14) {
        Resolution::Hour
    } else {
        Resolution::Day
    }
}

// ============================================================================
// API: Live reading
// ============================================================================

pub async fn handle_latest(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.recent_reading(Utc::now()) {
        Ok(reading) => Json(reading).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Series
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
}

/// One averaged point of a series.
#[derive(Debug, Serialize)]
pub struct SeriesPoint {
    pub time: DateTime<Utc>,
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub count: i64,
}

impl From<&Sample> for SeriesPoint {
    fn from(s: &Sample) -> Self {
        Self {
            time: s.time,
            power: s.power,
            voltage: s.voltage,
            current: s.current,
            count: 1,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution: Resolution,
    pub points: Vec<SeriesPoint>,
}

pub async fn handle_series(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> impl IntoResponse {
    let (start, end) = match parse_range(
        query.start.as_deref(),
        query.end.as_deref(),
        ChronoDuration::hours(24),
    ) {
        Ok(range) => range,
        Err(resp) => return resp,
    };

    let resolution = match query.resolution.as_deref() {
        Some(r) => match r.parse::<Resolution>() {
            Ok(r) => r,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
        None => select_resolution(end - start),
    };

    // Samples are already one per minute, so the minute series is read
    // straight from them.
    let points: Result<Vec<SeriesPoint>, DbError> = match resolution {
        Resolution::Minute => state
            .store
            .get_samples(start, end)
            .map(|samples| samples.iter().map(SeriesPoint::from).collect()),
        _ => state
            .store
            .get_buckets(resolution, start, end)
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|b| SeriesPoint {
                        time: b.bucket_start,
                        power: b.power_avg(),
                        voltage: b.voltage_avg(),
                        current: b.current_avg(),
                        count: b.count,
                    })
                    .collect()
            }),
    };

    match points {
        Ok(points) => Json(SeriesResponse {
            start,
            end,
            resolution,
            points,
        })
        .into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Energy
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnergyQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnergyResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_kwh: f64,
}

pub async fn handle_energy(
    State(state): State<AppState>,
    Query(query): Query<EnergyQuery>,
) -> impl IntoResponse {
    let (start, end) = match parse_range(
        query.start.as_deref(),
        query.end.as_deref(),
        ChronoDuration::hours(24),
    ) {
        Ok(range) => range,
        Err(resp) => return resp,
    };

    let max_gap = ChronoDuration::seconds(state.config.max_energy_gap_secs);
    match energy_between(&state.store, start, end, Utc::now(), max_gap) {
        Ok(energy_kwh) => Json(EnergyResponse {
            start,
            end,
            energy_kwh,
        })
        .into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_energy_comparison(State(state): State<AppState>) -> impl IntoResponse {
    let max_gap = ChronoDuration::seconds(state.config.max_energy_gap_secs);
    match energy_comparison(&state.store, Utc::now(), max_gap) {
        Ok(comparison) => Json(comparison).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Alert history
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub alert_id: Option<i64>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub skip: Option<i64>,
}

pub async fn handle_alert_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let start = match parse_time(query.start.as_deref(), "start") {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let end = match parse_time(query.end.as_deref(), "end") {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let defaults = HistoryFilter::default();
    let filter = HistoryFilter {
        alert_id: query.alert_id,
        metric: query.metric.filter(|m| !m.is_empty()),
        start,
        end,
        limit: query.limit.unwrap_or(defaults.limit),
        skip: query.skip.unwrap_or(0).max(0),
    };

    match state.store.query_alert_history(&filter) {
        Ok(page) => Json(page).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteHistoryRequest {
    #[serde(default)]
    pub older_than: Option<String>,
    #[serde(default)]
    pub alert_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeleteHistoryResponse {
    pub deleted_count: usize,
}

pub async fn handle_delete_alert_history(
    State(state): State<AppState>,
    Json(req): Json<DeleteHistoryRequest>,
) -> impl IntoResponse {
    let older_than = match parse_time(req.older_than.as_deref(), "older_than") {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.store.delete_alert_history(older_than, req.alert_id) {
        Ok(deleted_count) => {
            tracing::info!("Deleted {} alert history entries", deleted_count);
            Json(DeleteHistoryResponse { deleted_count }).into_response()
        }
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Maintenance
// ============================================================================

pub async fn handle_run_rollups(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.rollup_manager().run(Utc::now()) {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (StatusCode::CONFLICT, "Rollup already running").into_response(),
        Err(e) => db_error(e),
    }
}
