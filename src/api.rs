use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::pool::workers::{PoolStatus, WorkerPool};
use crate::registry::job::{Hyperparameters, Job, JobState};
use crate::registry::table::JobRegistry;
use crate::store::artifact::ArtifactId;
use crate::store::disk::ArtifactStore;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub registry: Arc<RwLock<JobRegistry>>,
    pub store: Arc<RwLock<ArtifactStore>>,
    pub pool: Arc<WorkerPool>,
    /// Bound on how long `POST /train?sync=true` may wait.
    pub sync_wait: Duration,
}

#[derive(Deserialize)]
pub struct TrainRequest {
    pub hyperparameters: Hyperparameters,
}

#[derive(Deserialize)]
struct TrainQuery {
    #[serde(default)]
    sync: bool,
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: Uuid,
}

#[derive(Serialize)]
struct SyncTrainResponse {
    job_id: Uuid,
    model_id: ArtifactId,
}

#[derive(Serialize)]
struct JobResponse {
    job_id: Uuid,
    state: JobState,
    hyperparameters: Hyperparameters,
    attempt_count: u32,
    artifact_id: Option<ArtifactId>,
    error: Option<String>,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            hyperparameters: job.hyperparameters.clone(),
            attempt_count: job.attempt_count,
            artifact_id: job.artifact_id,
            error: job.error.clone(),
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    state: Option<JobState>,
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: Uuid,
    state: JobState,
}

#[derive(Serialize)]
struct LatestResponse {
    artifact_id: ArtifactId,
    job_id: Uuid,
    created_at: DateTime<Utc>,
    size: u64,
}

#[derive(Serialize)]
struct JobCounts {
    pending: usize,
    running: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
}

#[derive(Serialize)]
struct ServiceStatus {
    jobs: JobCounts,
    pool: PoolStatus,
    artifacts: usize,
    latest_artifact: Option<ArtifactId>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: DispatchError) -> Response {
    let status = match &err {
        DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
        DispatchError::Overloaded | DispatchError::Capacity => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::JobNotFound(_) | DispatchError::ArtifactNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DispatchError::InvalidTransition { .. } | DispatchError::Cancelled => StatusCode::CONFLICT,
        DispatchError::WaitTimeout => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Training(_) | DispatchError::Storage(_) | DispatchError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn submit_training(
    State(state): State<ApiState>,
    Query(query): Query<TrainQuery>,
    Json(req): Json<TrainRequest>,
) -> Response {
    if query.sync {
        return match state
            .dispatcher
            .submit_and_wait(req.hyperparameters, state.sync_wait)
            .await
        {
            Ok((job_id, model_id)) => {
                (StatusCode::OK, Json(SyncTrainResponse { job_id, model_id })).into_response()
            }
            Err(e) => error_response(e),
        };
    }

    match state.dispatcher.submit(req.hyperparameters).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(SubmitResponse { job_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<JobResponse>> {
    let registry = state.registry.read().await;
    let jobs = match query.state {
        Some(s) => state_sorted(registry.jobs_in_state(s)),
        None => registry.all_jobs(),
    };
    Json(jobs.into_iter().map(JobResponse::from).collect())
}

fn state_sorted(mut jobs: Vec<&Job>) -> Vec<&Job> {
    jobs.sort_by_key(|j| j.submitted_at);
    jobs
}

async fn job_status(State(state): State<ApiState>, Path(job_id): Path<Uuid>) -> Response {
    let registry = state.registry.read().await;
    match registry.get(&job_id) {
        Some(job) => Json(JobResponse::from(job)).into_response(),
        None => error_response(DispatchError::JobNotFound(job_id)),
    }
}

async fn cancel_job(State(state): State<ApiState>, Path(job_id): Path<Uuid>) -> Response {
    match state.dispatcher.cancel(job_id).await {
        Ok(()) => Json(CancelResponse {
            job_id,
            state: JobState::Cancelled,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn latest_model(State(state): State<ApiState>) -> Response {
    let store = state.store.read().await;
    match store.latest() {
        Some(artifact) => Json(LatestResponse {
            artifact_id: artifact.id,
            job_id: artifact.job_id,
            created_at: artifact.created_at,
            size: artifact.size,
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "no artifacts stored yet".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn model_payload(
    State(state): State<ApiState>,
    Path(artifact_id): Path<ArtifactId>,
) -> Response {
    let store = state.store.read().await;
    match store.get(artifact_id) {
        Ok(payload) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn service_status(State(state): State<ApiState>) -> Json<ServiceStatus> {
    let jobs = {
        let registry = state.registry.read().await;
        JobCounts {
            pending: registry.jobs_in_state(JobState::Pending).len(),
            running: registry.jobs_in_state(JobState::Running).len(),
            succeeded: registry.jobs_in_state(JobState::Succeeded).len(),
            failed: registry.jobs_in_state(JobState::Failed).len(),
            cancelled: registry.jobs_in_state(JobState::Cancelled).len(),
        }
    };
    let (artifacts, latest_artifact) = {
        let store = state.store.read().await;
        (store.len(), store.latest().map(|a| a.id))
    };
    Json(ServiceStatus {
        jobs,
        pool: state.pool.snapshot(),
        artifacts,
        latest_artifact,
    })
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/train", post(submit_training))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_id}", get(job_status))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route("/model/latest", get(latest_model))
        .route("/model/{artifact_id}", get(model_payload))
        .route("/status", get(service_status))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the API until the shutdown token fires.
pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DispatchError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| DispatchError::Internal(format!("server error: {e}")))?;
    Ok(())
}
