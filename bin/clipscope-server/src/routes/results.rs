//! Artifact endpoints; all of them require a `complete` job.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use clipscope_core::ArtifactKind;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::routes::parse_job_id;
use crate::schemas::job::DownloadFile;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_report, get_video, download))]
pub struct ResultsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/results/{job_id}/report", get(get_report))
        .route("/results/{job_id}/video", get(get_video))
        .route("/download/{job_id}/{file_type}", get(download))
}

fn artifact_response(kind: ArtifactKind, bytes: Bytes, attachment: Option<String>) -> Response {
    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static(kind.content_type()))],
        Body::from(bytes),
    )
        .into_response();
    let disposition = attachment
        .and_then(|name| HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")).ok());
    if let Some(value) = disposition {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

async fn serve(
    state: &AppState,
    raw_id: &str,
    kind: ArtifactKind,
    download: Option<DownloadFile>,
) -> Result<Response, ServerError> {
    let job_id = parse_job_id(raw_id)?;
    let (_, bytes) = state.orchestrator.artifact(job_id, kind).await?;
    let attachment = download.map(|file| file.attachment_name(&job_id.to_string()));
    Ok(artifact_response(kind, bytes, attachment))
}

#[utoipa::path(
    get,
    path = "/results/{job_id}/report",
    tag = "results",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Markdown report", content_type = "text/markdown", body = String),
        (status = 404, description = "Unknown or evicted job"),
        (status = 409, description = "Job not complete"),
    )
)]
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ServerError> {
    serve(&state, &job_id, ArtifactKind::Report, None).await
}

#[utoipa::path(
    get,
    path = "/results/{job_id}/video",
    tag = "results",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Source video", content_type = "video/mp4", body = Vec<u8>),
        (status = 404, description = "Unknown or evicted job"),
        (status = 409, description = "Job not complete"),
    )
)]
pub async fn get_video(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ServerError> {
    serve(&state, &job_id, ArtifactKind::SourceVideo, None).await
}

#[utoipa::path(
    get,
    path = "/download/{job_id}/{file_type}",
    tag = "results",
    params(
        ("job_id" = String, Path, description = "Job id"),
        ("file_type" = String, Path, description = "`video` or `report`"),
    ),
    responses(
        (status = 200, description = "File as attachment"),
        (status = 400, description = "Unknown file type"),
        (status = 404, description = "Unknown or evicted job"),
        (status = 409, description = "Job not complete"),
    )
)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((job_id, file_type)): Path<(String, String)>,
) -> Result<Response, ServerError> {
    let file: DownloadFile = file_type.parse().map_err(|_| {
        ServerError::BadRequest(format!(
            "unknown file type '{file_type}', expected 'video' or 'report'"
        ))
    })?;
    serve(&state, &job_id, file.kind(), Some(file)).await
}
