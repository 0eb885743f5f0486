// =============================================================================
// REST endpoints: symbol search, bar history, health
// =============================================================================
//
// All routes live under `/api/v1/`. Validation problems come back as 4xx
// with a JSON error body and never touch the provider; upstream failures in
// the history path are logged and surfaced as 500. History responses are
// cached per full query string: 6 h for daily periods, 10 min for minute
// periods.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::error;

use crate::history;
use crate::provider::MinuteHistoryUnsupported;
use crate::state::AppState;
use crate::types::{Bar, HistoryResponse, Period, SymbolSearchResponse};

type ApiError = (StatusCode, Json<serde_json::Value>);

const DAILY_CACHE_TTL_SECONDS: u64 = 6 * 60 * 60;
const MINUTE_CACHE_TTL_SECONDS: u64 = 10 * 60;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.settings.cors_allow_origins);

    Router::new()
        .route("/api/v1/symbols/search", get(search_symbols))
        .route("/api/v1/bars/history", get(bars_history))
        .route("/api/v1/health", get(health))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allow_origins: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = allow_origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty() && *origin != "*")
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allow_origins.split(',').any(|origin| origin.trim() == "*") || origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339(),
        "cache_backend": state.settings.cache_backend.to_string(),
        "timezone": state.settings.timezone.name(),
        "trading_calendar_size": state.clock.calendar_size(),
        "poller_running": state.poller.is_running(),
    }))
}

// =============================================================================
// Symbol search
// =============================================================================

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    20
}

async fn search_symbols(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SymbolSearchResponse>, ApiError> {
    if query.q.is_empty() {
        return Ok(Json(SymbolSearchResponse { items: Vec::new() }));
    }
    let limit = query.limit.clamp(1, 50);
    let items = state
        .provider
        .search_symbols(query.q, limit)
        .await
        .map_err(|e| {
            error!(error = %e, "symbol search failed");
            internal_error()
        })?;
    Ok(Json(SymbolSearchResponse { items }))
}

// =============================================================================
// Bar history
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    symbol: String,
    period: String,
    from: String,
    to: String,
    limit: Option<usize>,
}

async fn bars_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Some(period) = Period::parse(&query.period) else {
        return Err(bad_request("unsupported period"));
    };
    let limit = query
        .limit
        .unwrap_or(state.settings.history_max_limit)
        .clamp(1, state.settings.history_max_limit);

    let cache_key = format!(
        "history:{}:{}:{}:{}:{}",
        query.symbol, period, query.from, query.to, limit
    );
    if let Some(cached) = state.history_cache.get(&cache_key).await {
        return Ok(Json(cached));
    }

    let tz = state.settings.timezone;
    let items = if period.is_daily() {
        fetch_daily(&state, &query.symbol, period, &query.from, &query.to, tz).await?
    } else {
        fetch_minute(&state, &query.symbol, period, &query.from, &query.to, tz).await?
    };

    let items: Vec<Bar> = items.into_iter().take(limit).collect();
    let next_from = items.last().map(|bar| bar.ts + 1);
    let response = HistoryResponse {
        symbol: query.symbol,
        period,
        items,
        next_from,
    };

    let ttl = if period.is_daily() {
        DAILY_CACHE_TTL_SECONDS
    } else {
        MINUTE_CACHE_TTL_SECONDS
    };
    state.history_cache.set(&cache_key, &response, ttl).await;
    Ok(Json(response))
}

async fn fetch_daily(
    state: &AppState,
    symbol: &str,
    period: Period,
    from: &str,
    to: &str,
    tz: Tz,
) -> Result<Vec<Bar>, ApiError> {
    let start = parse_date(from)?;
    let end = parse_date(to)?;
    let items = state
        .provider
        .get_daily_history(symbol.to_string(), start, end)
        .await
        .map_err(|e| {
            error!(symbol, error = %e, "daily history failed");
            internal_error()
        })?;
    Ok(history::aggregate_bars(&items, period, tz))
}

async fn fetch_minute(
    state: &AppState,
    symbol: &str,
    period: Period,
    from: &str,
    to: &str,
    tz: Tz,
) -> Result<Vec<Bar>, ApiError> {
    let start = parse_datetime(from, tz)?;
    let end = parse_datetime(to, tz)?;
    if end < start {
        return Err(bad_request("invalid range"));
    }
    let max_window = Duration::days(state.settings.minute_history_max_days);
    let start = if end - start > max_window {
        end - max_window
    } else {
        start
    };

    match state
        .provider
        .get_minute_history(symbol.to_string(), period, start, end)
        .await
    {
        Ok(items) if items.is_empty() => Ok(history::fallback_recent_minute_history(
            &state.provider,
            symbol,
            period,
            end,
            tz,
        )
        .await),
        Ok(items) => Ok(items),
        Err(e) if e.is::<MinuteHistoryUnsupported>() => Err((
            StatusCode::NOT_IMPLEMENTED,
            Json(serde_json::json!({"error": "minute history not implemented"})),
        )),
        Err(e) => {
            error!(symbol, error = %e, "minute history failed");
            Err(internal_error())
        }
    }
}

// =============================================================================
// Parsing and error helpers
// =============================================================================

fn parse_date(value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| bad_request("invalid date format"))
}

/// Minute-range endpoints accept UTC-ms integers, RFC 3339 datetimes, or
/// naive datetimes interpreted in the market timezone.
fn parse_datetime(value: &str, tz: Tz) -> Result<DateTime<Utc>, ApiError> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let ms: i64 = value
            .parse()
            .map_err(|_| bad_request("invalid datetime format"))?;
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| bad_request("invalid datetime format"));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            if let Some(local) = tz.from_local_datetime(&naive).earliest() {
                return Ok(local.with_timezone(&Utc));
            }
        }
    }
    Err(bad_request("invalid datetime format"))
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal error"})),
    )
}

// =============================================================================
// Tests
// =============================================================================
