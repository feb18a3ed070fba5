pub mod cache;
pub mod config;
pub mod filter;
pub mod github;
pub mod metrics;
pub mod querier;
pub mod repository;
pub mod timeline;
pub mod types;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use config::AppConfig;
use filter::{FilterOptions, PrFilter};
use github::PullRequestSource;
use querier::{MetricsQuerier, MetricsResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const NO_DATA_MESSAGE: &str = "No pull request data available from GitHub";

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Shared application state accessible to all request handlers.
pub struct AppState {
    /// Service for querying pull request metrics.
    pub querier: MetricsQuerier,
    /// Application configuration loaded from environment variables.
    pub config: AppConfig,
}

impl AppState {
    /// Initializes the application state against the GitHub GraphQL API.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let querier = MetricsQuerier::new(&config)?;
        Ok(Self { querier, config })
    }

    pub fn with_source(config: AppConfig, source: Arc<dyn PullRequestSource>) -> Self {
        let querier = MetricsQuerier::with_source(&config, source);
        Self { querier, config }
    }
}

/// Query flags of `/api/metrics`; filter criteria are read separately as a `PrFilter`.
#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub include_pr_list: bool,
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/metrics", get(get_metrics))
        .route("/api/filters", get(get_filters))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "pr-velocity",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MetricsParams>,
    Query(filter): Query<PrFilter>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    match state
        .querier
        .metrics(&filter, params.force_refresh, params.include_pr_list)
        .await
    {
        Some(response) => {
            tracing::debug!(
                count = response.metrics.summary.count,
                errors = response.metrics.errors.len(),
                "Returning metrics"
            );
            Ok(Json(response))
        }
        None => {
            tracing::error!("Failed to retrieve PR data for /api/metrics");
            Err((StatusCode::SERVICE_UNAVAILABLE, NO_DATA_MESSAGE.to_string()))
        }
    }
}

pub async fn get_filters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FilterOptions>, (StatusCode, String)> {
    match state.querier.filter_options().await {
        Some(options) => Ok(Json(options)),
        None => {
            tracing::error!("Failed to retrieve PR data for /api/filters");
            Err((StatusCode::SERVICE_UNAVAILABLE, NO_DATA_MESSAGE.to_string()))
        }
    }
}
