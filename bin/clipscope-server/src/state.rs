//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use clipscope_core::Orchestrator;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Handle on the job orchestrator; cheap to clone.
    pub orchestrator: Orchestrator,
}
