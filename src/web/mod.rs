//! HTTP control surface for the scheduler.
//!
//! Routes:
//! - `POST /src_only`, `/src_first`, `/dst_only`, `/dst_first`
//! - `POST /full/start`, `/full/stop`
//! - `POST /incr/start` with `{"update_time": i64, "interval_ms": i64}`
//!   (`interval` is accepted as an alias), `POST /incr/stop`
//! - `GET /status`
//!
//! Every POST answers `{"code": <http status>, "msg": ...}`.

use crate::core::{Entity, MigrateError};
use crate::routing::RoutingPolicy;
use crate::scheduler::{Scheduler, SchedulerStatus};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub code: u16,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl ApiResponse {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            msg: msg.into(),
            job_id: None,
        }
    }

    fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StartIncrRequest {
    pub update_time: i64,
    #[serde(alias = "interval")]
    pub interval_ms: i64,
}

#[derive(Debug)]
pub enum WebError {
    Migrate(MigrateError),
    Input(String),
}

impl From<MigrateError> for WebError {
    fn from(err: MigrateError) -> Self {
        WebError::Migrate(err)
    }
}

impl From<JsonRejection> for WebError {
    fn from(rejection: JsonRejection) -> Self {
        WebError::Input(rejection.body_text())
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            WebError::Migrate(err @ MigrateError::UnknownPolicy(_))
            | WebError::Migrate(err @ MigrateError::Config(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            WebError::Migrate(err) => {
                error!(error = %err, "control request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            WebError::Input(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(ApiResponse {
            code: status.as_u16(),
            msg,
            job_id: None,
        });
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

type SchedulerState<T> = State<Arc<Scheduler<T>>>;

pub fn router<T: Entity>(scheduler: Arc<Scheduler<T>>) -> Router {
    Router::new()
        .route("/src_only", post(policy_handler::<T, SrcOnly>))
        .route("/src_first", post(policy_handler::<T, SrcFirst>))
        .route("/dst_only", post(policy_handler::<T, DstOnly>))
        .route("/dst_first", post(policy_handler::<T, DstFirst>))
        .route("/full/start", post(start_full::<T>))
        .route("/full/stop", post(stop_full::<T>))
        .route("/incr/start", post(start_incr::<T>))
        .route("/incr/stop", post(stop_incr::<T>))
        .route("/status", get(status::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(scheduler)
}

/// Route-level policy constant.
trait PolicyRoute {
    const POLICY: RoutingPolicy;
}

struct SrcOnly;
struct SrcFirst;
struct DstOnly;
struct DstFirst;

impl PolicyRoute for SrcOnly {
    const POLICY: RoutingPolicy = RoutingPolicy::SrcOnly;
}
impl PolicyRoute for SrcFirst {
    const POLICY: RoutingPolicy = RoutingPolicy::SrcFirst;
}
impl PolicyRoute for DstOnly {
    const POLICY: RoutingPolicy = RoutingPolicy::DstOnly;
}
impl PolicyRoute for DstFirst {
    const POLICY: RoutingPolicy = RoutingPolicy::DstFirst;
}

async fn policy_handler<T: Entity, P: PolicyRoute>(
    State(scheduler): SchedulerState<T>,
) -> Json<ApiResponse> {
    scheduler.set_policy(P::POLICY).await;
    Json(ApiResponse::ok("OK"))
}

async fn start_full<T: Entity>(State(scheduler): SchedulerState<T>) -> Result<Json<ApiResponse>> {
    let job_id = scheduler.start_full_validation().await?;
    Ok(Json(ApiResponse::ok("full validation started").with_job(job_id)))
}

async fn stop_full<T: Entity>(State(scheduler): SchedulerState<T>) -> Json<ApiResponse> {
    scheduler.stop_full_validation().await;
    Json(ApiResponse::ok("OK"))
}

async fn start_incr<T: Entity>(
    State(scheduler): SchedulerState<T>,
    body: std::result::Result<Json<StartIncrRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>> {
    let Json(req) = body?;
    let interval_ms = u64::try_from(req.interval_ms)
        .map_err(|_| WebError::Input("interval_ms must not be negative".to_string()))?;
    let job_id = scheduler
        .start_incremental_validation(req.update_time, Duration::from_millis(interval_ms))
        .await?;
    Ok(Json(
        ApiResponse::ok("incremental validation started").with_job(job_id),
    ))
}

async fn stop_incr<T: Entity>(State(scheduler): SchedulerState<T>) -> Json<ApiResponse> {
    scheduler.stop_incremental_validation().await;
    Json(ApiResponse::ok("OK"))
}

async fn status<T: Entity>(State(scheduler): SchedulerState<T>) -> Json<SchedulerStatus> {
    Json(scheduler.status().await)
}
