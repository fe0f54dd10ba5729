//! Axum JSON API over the review pipeline and stored corpus.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use revlens_analytics::{compute_report, AnalyticsReport};
use revlens_core::{
    non_blank, parse_days, parse_page, parse_platform, parse_sentiment, FilterError, Platform, ReviewFilters,
    StoredReview,
};
use revlens_storage::{PgReviewStore, ReviewStore, StoreError};
use revlens_sync::{IngestionSummary, ReviewPipeline, SourceReport, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "revlens-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReviewStore>,
    pub pipeline: Arc<ReviewPipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn ReviewStore>, pipeline: Arc<ReviewPipeline>) -> Self {
        Self { store, pipeline }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    message: String,
    total_found: usize,
    new_reviews: usize,
    duplicates_skipped: usize,
    failed: usize,
    sources: Vec<SourceReport>,
}

impl TriggerResponse {
    fn new(summary: IngestionSummary, sources: Vec<SourceReport>) -> Self {
        Self {
            message: format!(
                "Found {} reviews, stored {} new",
                summary.total_found, summary.newly_stored
            ),
            total_found: summary.total_found,
            new_reviews: summary.newly_stored,
            duplicates_skipped: summary.duplicates_skipped,
            failed: summary.failed,
            sources,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    platform: Option<String>,
    sentiment: Option<String>,
    business_name: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsQuery {
    business_name: Option<String>,
    platform: Option<String>,
    days: Option<String>,
}

#[derive(Debug, Serialize)]
struct Pagination {
    page: u32,
    limit: u32,
    total: u64,
    pages: u64,
}

#[derive(Debug, Serialize)]
struct ReviewPage {
    reviews: Vec<StoredReview>,
    pagination: Pagination,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    version: &'static str,
    store: &'static str,
    sources: Vec<Platform>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/reviews", get(list_reviews_handler).post(trigger_handler))
        .route("/reviews/analytics", get(analytics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store: Arc<dyn ReviewStore> = Arc::new(PgReviewStore::connect(&config.database_url).await?);
    let pipeline = Arc::new(ReviewPipeline::from_config(&config, store.clone()).await?);
    serve(AppState::new(store, pipeline), config.web_port).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let reachable = state.store.ping().await.is_ok();
    let body = Health {
        status: if reachable { "healthy" } else { "unhealthy" },
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        store: if reachable { "connected" } else { "unreachable" },
        sources: state.pipeline.platforms(),
    };
    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let business_name = non_blank(req.business_name.as_deref())
        .ok_or_else(|| ApiError::BadRequest("businessName is required".to_string()))?;
    let location = non_blank(req.location.as_deref());
    let run = state
        .pipeline
        .run_for_business(&business_name, location.as_deref())
        .await;
    Ok(Json(TriggerResponse::new(run.summary, run.sources)))
}

async fn list_reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ReviewPage>, ApiError> {
    let filters = ReviewFilters {
        business_name: non_blank(query.business_name.as_deref()),
        platform: parse_platform(query.platform.as_deref())?,
        sentiment: parse_sentiment(query.sentiment.as_deref())?,
        since: None,
    };
    let page = parse_page(query.page.as_deref(), query.limit.as_deref())?;

    let total = state.store.count_by_filters(&filters).await?;
    let reviews = state.store.query_by_filters(&filters, Some(page)).await?;
    Ok(Json(ReviewPage {
        reviews,
        pagination: Pagination {
            page: page.page,
            limit: page.limit,
            total,
            pages: page.total_pages(total),
        },
    }))
}

async fn analytics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsReport>, ApiError> {
    let days = parse_days(query.days.as_deref())?;
    let platform = parse_platform(query.platform.as_deref())?;
    let now = Utc::now();
    let filters = ReviewFilters::trailing_window(non_blank(query.business_name.as_deref()), platform, days, now);
    let slice = state.store.query_by_filters(&filters, None).await?;
    Ok(Json(compute_report(&slice, days, now)))
}
