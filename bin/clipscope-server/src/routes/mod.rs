//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - middleware layers (CORS, per-request trace id)
//! - the optional OpenAPI document (disable with `CLIPSCOPE_ENABLE_OPENAPI=false`)
//! - health, submission, status, streaming and result routes

mod analyze;
pub mod doc;
mod health;
mod jobs;
mod results;
mod stream;


use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, middleware};
use clipscope_core::JobId;
use tower::ServiceBuilder;

use crate::error::ServerError;
use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .merge(analyze::router(state.config.max_upload_bytes))
        .merge(jobs::router())
        .merge(stream::router())
        .merge(results::router());

    if state.config.enable_openapi {
        let api_doc = doc::get_docs();
        app = app.route(
            "/api-docs/openapi.json",
            get(move || {
                let api_doc = api_doc.clone();
                async move { Json(api_doc) }
            }),
        );
    }

    app.layer(ServiceBuilder::new().layer(cors::cors_layer(&state.config)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

/// Job id from a path segment; anything unparsable is an unknown job.
pub(crate) fn parse_job_id(raw: &str) -> Result<JobId, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::NotFound(format!("job not found: {raw}")))
}
