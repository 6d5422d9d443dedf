//! Job submission endpoints.

use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use clipscope_core::JobInput;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::job::{AnalyzeRequest, JobAccepted, UploadForm};
use crate::state::AppState;

/// Multipart framing allowance on top of the upload size limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "webm", "mkv", "avi", "flv", "3gp"];

#[derive(OpenApi)]
#[openapi(
    paths(analyze_url, analyze_upload),
    components(schemas(AnalyzeRequest, JobAccepted, UploadForm))
)]
pub struct AnalyzeApi;

pub fn router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new().route("/analyze", post(analyze_url)).route(
        "/analyze-upload",
        post(analyze_upload).layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
        )),
    )
}

fn validate_url(raw: &str) -> Result<String, ServerError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(ServerError::BadRequest("url must not be empty".into()));
    }
    let uri: Uri = url
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid url: {url}")))?;
    let http = matches!(uri.scheme_str(), Some("http") | Some("https"));
    if !http || uri.host().is_none() {
        return Err(ServerError::BadRequest(format!(
            "url must be an http(s) link: {url}"
        )));
    }
    Ok(url.to_owned())
}

#[utoipa::path(
    post,
    path = "/analyze",
    tag = "jobs",
    request_body = AnalyzeRequest,
    responses(
        (status = 202, description = "Job queued", body = JobAccepted),
        (status = 400, description = "Empty or non-http(s) url"),
        (status = 503, description = "Submission queue full"),
    )
)]
pub async fn analyze_url(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ServerError> {
    let Json(req) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let url = validate_url(&req.url)?;

    let job_id = state.orchestrator.submit(JobInput::Url { url: url.clone() }).await?;
    info!(%job_id, %url, "url analysis submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job_id.to_string(),
        }),
    ))
}

fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge("upload exceeds the size limit".into())
    } else {
        ServerError::BadRequest(e.body_text())
    }
}

fn looks_like_video(field: &Field<'_>) -> bool {
    if field
        .content_type()
        .is_some_and(|ct| ct.starts_with("video/"))
    {
        return true;
    }
    field
        .file_name()
        .and_then(|name| name.rsplit_once('.'))
        .is_some_and(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

async fn read_video(
    mut multipart: Multipart,
    limit: usize,
) -> Result<(String, Bytes), ServerError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("video") {
            continue;
        }
        if !looks_like_video(&field) {
            return Err(ServerError::BadRequest(
                "the 'video' field must be a video file".into(),
            ));
        }
        let file_name = field.file_name().unwrap_or("upload.mp4").to_owned();
        let data = field.bytes().await.map_err(multipart_error)?;
        if data.is_empty() {
            return Err(ServerError::BadRequest("uploaded video is empty".into()));
        }
        if data.len() > limit {
            return Err(ServerError::PayloadTooLarge(format!(
                "upload of {} bytes exceeds the limit of {limit} bytes",
                data.len()
            )));
        }
        return Ok((file_name, data));
    }
    Err(ServerError::BadRequest(
        "multipart form has no 'video' field".into(),
    ))
}

#[utoipa::path(
    post,
    path = "/analyze-upload",
    tag = "jobs",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Job queued", body = JobAccepted),
        (status = 400, description = "Missing, empty or non-video file"),
        (status = 413, description = "Upload too large"),
        (status = 503, description = "Submission queue full"),
    )
)]
pub async fn analyze_upload(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>), ServerError> {
    let (file_name, video) = read_video(multipart, state.config.max_upload_bytes).await?;
    let size = video.len();

    let job_id = state.orchestrator.submit_upload(file_name.clone(), video).await?;
    info!(%job_id, file = %file_name, size, "upload analysis submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job_id.to_string(),
        }),
    ))
}
