//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use clipscope_core::services::{FfmpegConfig, GeminiConfig, WhisperConfig, YtDlpConfig};
use clipscope_core::{OrchestratorConfig, RetryPolicy, StageTimeouts};

/// Runtime configuration for clipscope-server.
///
/// Every field has a default except the Gemini key, which
/// [`Config::validate`] requires.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// sqlx SQLite URL of the job journal (default: `"sqlite://clipscope.db"`).
    pub database_url: String,

    /// Root directory of the artifact store.
    pub storage_dir: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    /// Taken from `CLIPSCOPE_LOG`, then `RUST_LOG`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins; `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_openapi: bool,

    pub queue_capacity: usize,
    pub max_concurrent_jobs: usize,
    /// Terminal jobs kept in memory and on disk.
    pub retention: usize,
    pub max_upload_bytes: usize,

    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub timeouts: StageTimeouts,

    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub ytdlp_bin: String,
    pub cookies_file: Option<PathBuf>,
    pub ffmpeg_bin: String,
    pub scene_threshold: f64,
    pub max_keyframes: usize,
    pub whisper_bin: String,
    pub whisper_model: PathBuf,
    pub whisper_language: String,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let env_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_owned());
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let defaults = StageTimeouts::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(get(key), default.as_secs()))
        };

        Self {
            bind_address: env_or("CLIPSCOPE_BIND", "0.0.0.0:8000"),
            database_url: env_or("CLIPSCOPE_DATABASE_URL", "sqlite://clipscope.db"),
            storage_dir: PathBuf::from(env_or("CLIPSCOPE_STORAGE_DIR", "temp_storage")),
            log_level: get("CLIPSCOPE_LOG")
                .or_else(|| get("RUST_LOG"))
                .unwrap_or_else(|| "info".to_owned()),
            log_json: flag("CLIPSCOPE_LOG_JSON", false),
            cors_allowed_origins: non_empty("CLIPSCOPE_CORS_ORIGINS"),
            enable_openapi: flag("CLIPSCOPE_ENABLE_OPENAPI", true),
            queue_capacity: parse_or(get("CLIPSCOPE_QUEUE_CAPACITY"), 64),
            max_concurrent_jobs: parse_or(get("CLIPSCOPE_MAX_CONCURRENT_JOBS"), 2),
            retention: parse_or(get("CLIPSCOPE_RETENTION"), 10),
            max_upload_bytes: parse_or(get("CLIPSCOPE_MAX_UPLOAD_SIZE_MB"), 200usize) * 1024 * 1024,
            retry_attempts: parse_or(get("CLIPSCOPE_RETRY_ATTEMPTS"), 3),
            retry_base_ms: parse_or(get("CLIPSCOPE_RETRY_BASE_MS"), 2000),
            timeouts: StageTimeouts {
                download: secs("CLIPSCOPE_TIMEOUT_DOWNLOAD_SECS", defaults.download),
                scene_extract: secs("CLIPSCOPE_TIMEOUT_SCENES_SECS", defaults.scene_extract),
                visual_analyze: secs("CLIPSCOPE_TIMEOUT_VISUAL_SECS", defaults.visual_analyze),
                transcribe: secs("CLIPSCOPE_TIMEOUT_TRANSCRIBE_SECS", defaults.transcribe),
                synthesize: secs("CLIPSCOPE_TIMEOUT_SYNTHESIZE_SECS", defaults.synthesize),
            },
            gemini_api_key: non_empty("CLIPSCOPE_GEMINI_API_KEY")
                .or_else(|| non_empty("GOOGLE_API_KEY")),
            gemini_model: env_or("CLIPSCOPE_GEMINI_MODEL", "gemini-1.5-flash"),
            ytdlp_bin: env_or("CLIPSCOPE_YTDLP_BIN", "yt-dlp"),
            cookies_file: non_empty("CLIPSCOPE_COOKIES_FILE").map(PathBuf::from),
            ffmpeg_bin: env_or("CLIPSCOPE_FFMPEG_BIN", "ffmpeg"),
            scene_threshold: parse_or(get("CLIPSCOPE_SCENE_THRESHOLD"), 0.3),
            max_keyframes: parse_or(get("CLIPSCOPE_MAX_KEYFRAMES"), 24),
            whisper_bin: env_or("CLIPSCOPE_WHISPER_BIN", "whisper-cli"),
            whisper_model: PathBuf::from(env_or(
                "CLIPSCOPE_WHISPER_MODEL",
                "models/ggml-base.bin",
            )),
            whisper_language: env_or("CLIPSCOPE_WHISPER_LANGUAGE", "auto"),
        }
    }

    /// Reject configurations the server cannot run jobs with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gemini_api_key.is_none() {
            anyhow::bail!(
                "no Gemini API key configured; set CLIPSCOPE_GEMINI_API_KEY or GOOGLE_API_KEY"
            );
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            queue_capacity: self.queue_capacity,
            max_concurrent_jobs: self.max_concurrent_jobs,
            retention_limit: self.retention.max(1),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_ms),
                ..RetryPolicy::default()
            },
            timeouts: self.timeouts,
            ..OrchestratorConfig::default()
        }
    }

    // Tool timeouts are kept 10 s under the matching stage timeout.

    pub fn ytdlp(&self) -> YtDlpConfig {
        YtDlpConfig {
            program: self.ytdlp_bin.clone(),
            cookies_file: self.cookies_file.clone(),
            timeout: tool_timeout(self.timeouts.download),
            ..YtDlpConfig::default()
        }
    }

    pub fn ffmpeg(&self) -> FfmpegConfig {
        FfmpegConfig {
            program: self.ffmpeg_bin.clone(),
            scene_threshold: self.scene_threshold,
            max_keyframes: self.max_keyframes.max(1),
            timeout: tool_timeout(self.timeouts.scene_extract),
            ..FfmpegConfig::default()
        }
    }

    pub fn whisper(&self) -> WhisperConfig {
        WhisperConfig {
            program: self.whisper_bin.clone(),
            model: self.whisper_model.clone(),
            language: self.whisper_language.clone(),
            ffmpeg_program: self.ffmpeg_bin.clone(),
            timeout: tool_timeout(self.timeouts.transcribe),
            ..WhisperConfig::default()
        }
    }

    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone().unwrap_or_default(),
            model: self.gemini_model.clone(),
            timeout: tool_timeout(self.timeouts.synthesize.max(self.timeouts.visual_analyze)),
            ..GeminiConfig::default()
        }
    }
}

fn tool_timeout(stage: Duration) -> Duration {
    stage
        .checked_sub(Duration::from_secs(10))
        .filter(|d| !d.is_zero())
        .unwrap_or(stage)
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind_address, "0.0.0.0:8000");
        assert_eq!(cfg.database_url, "sqlite://clipscope.db");
        assert_eq!(cfg.storage_dir, PathBuf::from("temp_storage"));
        assert!(cfg.enable_openapi);
        assert!(!cfg.log_json);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.max_upload_bytes, 200 * 1024 * 1024);
        assert_eq!(cfg.gemini_api_key, None);
        assert_eq!(cfg.orchestrator(), OrchestratorConfig::default());
    }

    #[test]
    fn overrides_and_fallbacks() {
        let cfg = config(&[
            ("CLIPSCOPE_RETENTION", "3"),
            ("CLIPSCOPE_LOG_JSON", "TRUE"),
            ("CLIPSCOPE_RETRY_BASE_MS", "50"),
            ("CLIPSCOPE_TIMEOUT_TRANSCRIBE_SECS", "42"),
            ("CLIPSCOPE_MAX_CONCURRENT_JOBS", "not-a-number"),
            ("CLIPSCOPE_CORS_ORIGINS", "  "),
            ("GOOGLE_API_KEY", "from-google"),
            ("RUST_LOG", "debug"),
        ]);
        assert_eq!(cfg.log_level, "debug");
        let orchestrator = cfg.orchestrator();
        assert_eq!(orchestrator.retention_limit, 3);
        assert_eq!(orchestrator.max_concurrent_jobs, 2);
        assert_eq!(orchestrator.retry.base_delay, Duration::from_millis(50));
        assert_eq!(orchestrator.timeouts.transcribe, Duration::from_secs(42));
        assert!(cfg.log_json);
        assert_eq!(cfg.cors_allowed_origins, None);
        assert_eq!(cfg.gemini_api_key.as_deref(), Some("from-google"));
        assert_eq!(cfg.whisper().timeout, Duration::from_secs(32));
    }

    #[test]
    fn missing_gemini_key_fails_validation() {
        let err = config(&[("GOOGLE_API_KEY", "   ")]).validate().unwrap_err();
        assert!(err.to_string().contains("GOOGLE_API_KEY"));
        assert!(config(&[("GOOGLE_API_KEY", "k")]).validate().is_ok());
    }

    #[test]
    fn retention_is_at_least_one() {
        let cfg = config(&[("CLIPSCOPE_RETENTION", "0")]);
        assert_eq!(cfg.orchestrator().retention_limit, 1);
    }

    #[test]
    fn explicit_gemini_key_wins() {
        let cfg = config(&[
            ("CLIPSCOPE_GEMINI_API_KEY", "mine"),
            ("GOOGLE_API_KEY", "other"),
        ]);
        assert_eq!(cfg.gemini().api_key, "mine");
    }

    #[test]
    fn tool_timeout_never_collapses_to_zero() {
        assert_eq!(tool_timeout(Duration::from_secs(300)), Duration::from_secs(290));
        assert_eq!(tool_timeout(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(tool_timeout(Duration::from_secs(10)), Duration::from_secs(10));
    }
}
