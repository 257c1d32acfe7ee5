use std::net::SocketAddr;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{AdmissionError, DownloadError, SitegrabError};
use crate::scheduler::{BrowserKind, JobId, JobView, RequestedActions, ScreenshotFormat};
use crate::service::{CaptureService, QueueStatus};

#[derive(Clone, Debug)]
pub struct ApiState {
    pub service: CaptureService,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub url: String,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub browser_fix: bool,
    #[serde(default)]
    pub screenshot: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub id: JobId,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by a handler, rendered as `{"error": ...}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// A request body axum could not extract, with the status it chose.
    Rejected(StatusCode, String),
    Service(SitegrabError),
}

impl From<SitegrabError> for ApiError {
    fn from(e: SitegrabError) -> Self {
        ApiError::Service(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(status, _) => *status,
            ApiError::Service(e) => match e {
                SitegrabError::Validation(_) => StatusCode::BAD_REQUEST,
                SitegrabError::Admission(AdmissionError::QueueFull { .. }) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                SitegrabError::Admission(AdmissionError::OriginBusy) => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                SitegrabError::JobNotFound(_) | SitegrabError::Download(DownloadError::NotFound) => {
                    StatusCode::NOT_FOUND
                }
                SitegrabError::Download(DownloadError::NotFinished) => StatusCode::CONFLICT,
                SitegrabError::Download(DownloadError::Expired) => StatusCode::GONE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::BadRequest(msg) | ApiError::Rejected(_, msg) => msg,
            ApiError::Service(e) => e.to_string(),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

fn parse_id(query: Result<Query<IdQuery>, QueryRejection>) -> Result<JobId, ApiError> {
    let invalid = || ApiError::BadRequest("missing or invalid id".to_string());
    let Query(query) = query.map_err(|_| invalid())?;
    query.id.trim().parse().map_err(|_| invalid())
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status/queue", get(queue_status_handler))
        .route("/status/job", get(job_status_handler))
        .route("/job/new", post(new_job_handler))
        .route("/job/download", get(download_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` fires.
pub async fn run_api(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Starting HTTP API");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn queue_status_handler(State(state): State<ApiState>) -> Json<QueueStatus> {
    Json(state.service.queue_status())
}

async fn job_status_handler(
    State(state): State<ApiState>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_id(query)?;
    Ok(Json(state.service.get_job(&id)?))
}

async fn new_job_handler(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let Json(payload) = payload?;
    let actions = RequestedActions {
        browser: BrowserKind::parse_optional(payload.browser.as_deref())
            .map_err(SitegrabError::from)?,
        browser_fix: payload.browser_fix,
        screenshot: ScreenshotFormat::parse_optional(payload.screenshot.as_deref())
            .map_err(SitegrabError::from)?,
    };

    let origin = peer.ip().to_canonical();
    let id = state.service.submit(&payload.url, origin, actions).await?;
    Ok(Json(SubmitJobResponse { id }))
}

async fn download_handler(
    State(state): State<ApiState>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let id = parse_id(query)?;
    let bytes = state.service.download(&id).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}.zip", id),
            ),
        ],
        bytes,
    )
        .into_response())
}
