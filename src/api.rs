//! HTTP surface over the aggregator and ETL runner.
//!
//! | Route           | Method |
//! |-----------------|--------|
//! | `/etl/run`      | POST   |
//! | `/stats`        | GET    |
//! | `/data`         | GET    |
//! | `/map`          | GET    |
//! | `/download.csv` | GET    |
//! | `/health`       | GET    |
//!
//! Errors are returned as `{"error": "<message>"}`.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::aggregate::{Aggregator, DEFAULT_PAGE_LIMIT, QueryParams, parse_date};
use crate::error::Error;
use crate::etl::{EtlReport, EtlRequest, EtlRunner, RegionSelection};
use crate::stats::{RegionMeans, RowPage, SummaryStats};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Aggregator,
    pub runner: EtlRunner,
}

impl AppState {
    /// Both halves share the runner's store.
    pub fn new(runner: EtlRunner) -> Self {
        Self {
            aggregator: Aggregator::new(runner.store().clone()),
            runner,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/etl/run", post(run_etl))
        .route("/stats", get(get_stats))
        .route("/data", get(get_data))
        .route("/map", get(get_map))
        .route("/download.csv", get(download_csv))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wraps a crate [`Error`] for conversion into an HTTP response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            Error::FetchFailure { .. } | Error::Unreachable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(status = %status, error = %self.0, "Request failed");
        } else {
            warn!(status = %status, error = %self.0, "Request rejected");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EtlParams {
    #[serde(default = "default_region")]
    pub region: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn default_region() -> String {
    "MA".to_string()
}

/// POST /etl/run
async fn run_etl(
    State(state): State<AppState>,
    Query(params): Query<EtlParams>,
) -> Result<Json<EtlReport>, ApiError> {
    info!(
        region = %params.region,
        start_date = ?params.start_date,
        end_date = ?params.end_date,
        "ETL job requested"
    );
    let start = parse_date("start_date", params.start_date.as_deref())?;
    let end = parse_date("end_date", params.end_date.as_deref())?;
    let (Some(start_date), Some(end_date)) = (start, end) else {
        return Err(Error::InvalidDateRange("start_date and end_date are required".to_string()).into());
    };

    let request = EtlRequest {
        regions: RegionSelection::parse(&params.region)?,
        start_date,
        end_date,
    };
    Ok(Json(state.runner.run(&request).await?))
}

/// GET /stats
async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<SummaryStats>, ApiError> {
    Ok(Json(state.aggregator.stats(&params).await?))
}

#[derive(Debug, Deserialize)]
pub struct DataParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    pub region: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_LIMIT
}

/// GET /data
async fn get_data(
    State(state): State<AppState>,
    Query(params): Query<DataParams>,
) -> Result<Json<RowPage>, ApiError> {
    let filters = QueryParams {
        region: params.region,
        start_date: params.start_date,
        end_date: params.end_date,
    };
    let page = state
        .aggregator
        .rows(&filters, params.limit, params.offset)
        .await?;
    info!(returned = page.rows.len(), total = page.total, "Returning rows");
    Ok(Json(page))
}

/// GET /map
async fn get_map(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<RegionMeans>, ApiError> {
    Ok(Json(state.aggregator.map(&params).await?))
}

/// GET /download.csv
async fn download_csv(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let body = state.aggregator.export_csv(&params).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"cleaned.csv\"",
            ),
        ],
        body,
    )
        .into_response())
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
