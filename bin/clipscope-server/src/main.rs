//! clipscope-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON or human-readable).
//! 3. Open the artifact store and the SQLite job journal.
//! 4. Wire the analysis pipeline to its external tools.
//! 5. Start the orchestrator, restoring retained jobs from the journal.
//! 6. Build the Axum router and serve with graceful shutdown.

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use clipscope_core::services::{
    FfmpegSceneDetector, GeminiClient, GeminiFrameAnalyzer, GeminiReportSynthesizer,
    WhisperCliTranscriber, YtDlpDownloader,
};
use clipscope_core::{FsArtifactStore, Orchestrator, Pipeline};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
        Ok(f) => f,
        Err(e) => {
            eprintln!(
                "WARN: log filter '{}' is not valid ({}); falling back to 'info'",
                cfg.log_level, e
            );
            tracing_subscriber::EnvFilter::new("info")
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "clipscope-server starting");
    cfg.validate()?;

    // ── 3. Storage ─────────────────────────────────────────────────────────────
    let artifacts = FsArtifactStore::open(&cfg.storage_dir).await?;
    info!(root = %artifacts.root().display(), "artifact store ready");

    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "job journal ready");

    // ── 4. Pipeline ────────────────────────────────────────────────────────────
    let gemini = GeminiClient::new(cfg.gemini())?;
    let pipeline = Pipeline::from_services(
        Arc::new(YtDlpDownloader::new(cfg.ytdlp())),
        Arc::new(FfmpegSceneDetector::new(cfg.ffmpeg())),
        Arc::new(GeminiFrameAnalyzer::new(gemini.clone())),
        Arc::new(WhisperCliTranscriber::new(cfg.whisper())),
        Arc::new(GeminiReportSynthesizer::new(gemini)),
    );

    // ── 5. Orchestrator ────────────────────────────────────────────────────────
    let orchestrator = Orchestrator::start(
        cfg.orchestrator(),
        pipeline,
        Arc::new(artifacts),
        Arc::new(store),
    )
    .await?;
    info!(
        max_concurrent_jobs = cfg.max_concurrent_jobs,
        retention = cfg.retention,
        "orchestrator started"
    );

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        orchestrator,
    });

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("clipscope-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
