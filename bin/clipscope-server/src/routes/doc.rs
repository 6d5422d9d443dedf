use utoipa::OpenApi;

use crate::routes::{analyze, health, jobs, results, stream};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "clipscope-server",
        description = "Short-form video analysis jobs: submit, follow, fetch the report."
    ),
    tags(
        (name = "jobs", description = "Submission, status and cancellation"),
        (name = "results", description = "Artifacts of completed jobs"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(analyze::AnalyzeApi::openapi());
    root.merge(jobs::JobsApi::openapi());
    root.merge(stream::StreamApi::openapi());
    root.merge(results::ResultsApi::openapi());
    root
}
