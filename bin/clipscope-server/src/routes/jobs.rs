//! Job status, listing and cancellation endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clipscope_core::JobSnapshot;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::routes::parse_job_id;
use crate::schemas::job::{CancelAccepted, JobSummary, StatusResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_status, list_jobs, get_job, cancel_job),
    components(schemas(StatusResponse, JobSummary, CancelAccepted))
)]
pub struct JobsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status/{job_id}", get(get_status))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/cancel/{job_id}", post(cancel_job))
}

#[utoipa::path(
    get,
    path = "/status/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Current status", body = StatusResponse),
        (status = 404, description = "Unknown or evicted job"),
    )
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ServerError> {
    let job_id = parse_job_id(&job_id)?;
    let snapshot = state.orchestrator.status(job_id).await?;
    Ok(Json(StatusResponse::from(snapshot.as_ref())))
}

#[utoipa::path(
    get,
    path = "/jobs",
    tag = "jobs",
    responses(
        (status = 200, description = "Retained jobs, newest first", body = [JobSummary]),
    )
)]
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobSummary>> {
    let jobs = state.orchestrator.list_jobs().await;
    Json(jobs.iter().map(|s| JobSummary::from(s.as_ref())).collect())
}

#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Full snapshot with stage results and transitions", body = Object),
        (status = 404, description = "Unknown or evicted job"),
    )
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ServerError> {
    let job_id = parse_job_id(&job_id)?;
    let snapshot = state.orchestrator.status(job_id).await?;
    Ok(Json(JobSnapshot::clone(&snapshot)))
}

#[utoipa::path(
    post,
    path = "/cancel/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 202, description = "Cancellation requested", body = CancelAccepted),
        (status = 404, description = "Unknown or evicted job"),
        (status = 409, description = "Job already finished"),
    )
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<CancelAccepted>), ServerError> {
    let job_id = parse_job_id(&job_id)?;
    let status = state.orchestrator.cancel(job_id).await?;
    info!(%job_id, %status, "cancellation accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelAccepted {
            job_id: job_id.to_string(),
            status: status.as_str().to_owned(),
        }),
    ))
}
