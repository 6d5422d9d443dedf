//! Server-sent status events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use tracing::debug;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::routes::parse_job_id;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(stream_status))]
pub struct StreamApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/stream/{job_id}", get(stream_status))
}

/// Status changes of a job as SSE.
///
/// The last known status is sent first; every `data:` line is a status
/// string and the stream closes after `complete` or `failed`.
#[utoipa::path(
    get,
    path = "/stream/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Event stream of status strings", content_type = "text/event-stream", body = String),
        (status = 404, description = "Unknown or evicted job"),
    )
)]
pub async fn stream_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let job_id = parse_job_id(&job_id)?;
    let events = state.orchestrator.subscribe(job_id).await?;
    debug!(%job_id, "status stream opened");

    let stream =
        events.map(|event| Ok::<_, Infallible>(Event::default().data(event.status.as_str())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
