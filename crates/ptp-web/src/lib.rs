//! Axum JSON API over a running PriceTracker Pro runner.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use ptp_core::{Listing, ListingFilter, SnapshotSummary};
use ptp_sync::{AlertConfig, CollectionConfig, ConfigError, RunError, Runner};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "ptp-web";
pub const DEFAULT_PORT: u16 = 8000;
const CHEAPEST_IN_SUMMARY: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
}

impl AppState {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Serialize)]
struct ApiError {
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct SummaryResponse<'a> {
    summary: SnapshotSummary,
    cheapest: Vec<&'a Listing>,
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    collection: CollectionConfig,
    alerts: AlertConfig,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    collection: CollectionConfig,
    alerts: AlertConfig,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/snapshots", get(snapshots_handler))
        .route("/snapshots/latest", get(latest_snapshot_handler))
        .route("/listings", get(listings_handler))
        .route("/summary", get(summary_handler))
        .route("/trends", get(trends_handler))
        .route("/trends/chart", get(trend_chart_handler))
        .route("/runs", post(trigger_run_handler))
        .route("/config", put(update_config_handler).get(config_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PTP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(runner: Arc<Runner>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving price tracker api");
    axum::serve(listener, app(AppState::new(runner))).await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.runner.status()).into_response()
}

async fn snapshots_handler(State(state): State<Arc<AppState>>) -> Response {
    let summaries = state
        .runner
        .history()
        .all()
        .iter()
        .map(|s| s.summary())
        .collect::<Vec<_>>();
    Json(summaries).into_response()
}

async fn latest_snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.history().latest() {
        Some(snapshot) => Json(snapshot.as_ref()).into_response(),
        None => no_snapshot(),
    }
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let filter = match listing_filter(&params) {
        Ok(filter) => filter,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "invalid_query", message),
    };
    let Some(snapshot) = state.runner.history().latest() else {
        return no_snapshot();
    };
    Json(snapshot.filter(&filter)).into_response()
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(snapshot) = state.runner.history().latest() else {
        return no_snapshot();
    };
    Json(SummaryResponse {
        summary: snapshot.summary(),
        cheapest: snapshot.cheapest(CHEAPEST_IN_SUMMARY),
    })
    .into_response()
}

async fn trends_handler(State(state): State<Arc<AppState>>) -> Response {
    let history = state.runner.history().all();
    Json(state.runner.trend().compute_changes(&history)).into_response()
}

async fn trend_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    let history = state.runner.history().all();
    match state.runner.trend().render_trend(&history) {
        Ok(Some(artifact)) => (
            [
                (header::CONTENT_TYPE, artifact.content_type),
                (
                    header::CONTENT_DISPOSITION,
                    format!("inline; filename=\"{}\"", artifact.file_name),
                ),
            ],
            artifact.content,
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "a trend chart needs at least two snapshots",
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "render_failed", err.to_string()),
    }
}

async fn trigger_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.trigger_manual().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => run_error(&err),
    }
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Response {
    let config = state.runner.config();
    Json(ConfigView {
        collection: config.collection,
        alerts: config.alerts,
    })
    .into_response()
}

async fn update_config_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Response {
    match state.runner.update_config(update.collection, update.alerts) {
        Ok(config) => Json(ConfigView {
            collection: config.collection,
            alerts: config.alerts,
        })
        .into_response(),
        Err(err) => config_error(&err),
    }
}

/// `store` may repeat and may hold a comma-separated list.
fn listing_filter(params: &[(String, String)]) -> Result<ListingFilter, String> {
    let mut filter = ListingFilter::default();
    for (key, value) in params {
        match key.as_str() {
            "min_price" => filter.min_price = Some(parse_decimal(key, value)?),
            "max_price" => filter.max_price = Some(parse_decimal(key, value)?),
            "store" => filter.stores.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string),
            ),
            "only_discounts" => {
                filter.only_discounts = match value.as_str() {
                    "" | "1" | "true" => true,
                    "0" | "false" => false,
                    other => return Err(format!("only_discounts: expected a boolean, got {other:?}")),
                }
            }
            _ => {}
        }
    }
    Ok(filter)
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, String> {
    Decimal::from_str(value.trim()).map_err(|err| format!("{key}: {err}"))
}

fn run_error(err: &RunError) -> Response {
    let status = match err {
        RunError::Busy => StatusCode::CONFLICT,
        RunError::Collection(_) => StatusCode::BAD_GATEWAY,
        RunError::NoUsableListings { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RunError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.kind(), err.to_string())
}

fn config_error(err: &ConfigError) -> Response {
    error_response(StatusCode::BAD_REQUEST, err.kind(), err.to_string())
}

fn no_snapshot() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "no snapshot collected yet")
}

fn error_response(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            kind,
            message: message.into(),
        }),
    )
        .into_response()
}
