//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

fn parse_time(s: Option<&String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Default window: the trailing hour.
fn time_range(start: Option<&String>, end: Option<&String>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = parse_time(end).unwrap_or_else(Utc::now);
    let start = parse_time(start).unwrap_or_else(|| end - ChronoDuration::hours(1));
    (start, end)
}

// ============================================================================
// Status and health
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.snapshot())
}

pub async fn handle_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_firewalls() {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.store.stats().ok();
    let buffers = state.supervisor.buffer_occupancy();
    let buffered_samples: usize = buffers.values().sum();

    let targets: serde_json::Map<String, serde_json::Value> = state
        .supervisor
        .snapshot()
        .into_iter()
        .map(|(name, status)| {
            (
                name,
                json!({
                    "state": status.state,
                    "last_success": status.last_success,
                    "last_error": status.last_error,
                    "poll_count": status.poll_count,
                }),
            )
        })
        .collect();

    Json(json!({
        "status": "ok",
        "db_size_bytes": stats.as_ref().map(|s| s.db_size_bytes),
        "total_metrics": stats.as_ref().map(|s| s.total_metrics),
        "buffered_samples": buffered_samples,
        "buffers": buffers,
        "targets": targets,
        "pool": {
            "capacity": state.store.pool().capacity(),
            "checked_out": state.store.pool().checked_out(),
        },
    }))
}

// ============================================================================
// Metrics queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub target: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    /// Newest rows kept per target; absent means every matching row.
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> impl IntoResponse {
    let (start, end) = time_range(query.start.as_ref(), query.end.as_ref());

    match state.store.query(&query.target, start, end, query.limit) {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchMetricsQuery {
    /// Comma-separated target names.
    pub targets: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_metrics_batch(
    State(state): State<AppState>,
    Query(query): Query<BatchMetricsQuery>,
) -> impl IntoResponse {
    let targets: Vec<String> = query
        .targets
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if targets.is_empty() {
        return (StatusCode::BAD_REQUEST, "no targets given").into_response();
    }

    let (start, end) = time_range(query.start.as_ref(), query.end.as_ref());

    let cache_key = format!(
        "batch:{}:{}:{}:{:?}",
        query.targets, start, end, query.limit
    );
    if let Some(cached) = state.cache.get(&cache_key) {
        return Json(cached).into_response();
    }

    match state.store.batch_query(&targets, start, end, query.limit) {
        Ok(grouped) => {
            let value = serde_json::to_value(&grouped).unwrap_or_default();
            state.cache.insert(cache_key, value.clone());
            Json(value).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_defaults_to_trailing_hour() {
        let (start, end) = time_range(None, None);
        let span = end - start;
        assert_eq!(span.num_minutes(), 60);
    }

    #[test]
    fn test_time_range_parses_rfc3339() {
        let s = "2024-06-01T00:00:00Z".to_string();
        let e = "2024-06-01T06:00:00Z".to_string();
        let (start, end) = time_range(Some(&s), Some(&e));
        assert_eq!((end - start).num_hours(), 6);
    }

    #[test]
    fn test_bad_time_falls_back() {
        let bad = "yesterday-ish".to_string();
        let (start, end) = time_range(Some(&bad), None);
        assert!(start < end);
    }
}
