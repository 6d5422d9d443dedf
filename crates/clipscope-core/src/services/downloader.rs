use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::services::process::{ScratchDir, run_tool};
use crate::services::{Downloader, ServiceError};

/// stderr fragments of yt-dlp that no retry will fix.
const PERMANENT_MARKERS: &[&str] = &[
    "Unsupported URL",
    "Private video",
    "Video unavailable",
    "This video is not available",
    "This post may not be comfortable",
    "has been removed",
    "not available in your country",
    "Sign in to confirm",
    "login required",
];

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub program: String,
    /// Netscape cookie jar; ignored when the file does not exist.
    pub cookies_file: Option<PathBuf>,
    pub format: String,
    pub timeout: Duration,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".into(),
            cookies_file: None,
            format: "best".into(),
            timeout: Duration::from_secs(290),
        }
    }
}

/// Accept only direct links to a single video or note post.
///
/// Profiles, search pages and other listings are rejected.
pub fn validate_video_url(url: &str) -> Result<Url, ServiceError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| ServiceError::UnsupportedUrl(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ServiceError::UnsupportedUrl(url.to_owned()));
    }
    let path = parsed.path();
    if !(path.contains("/video/") || path.contains("/note/")) {
        return Err(ServiceError::UnsupportedUrl(format!(
            "{url}: not a direct video or note link"
        )));
    }
    Ok(parsed)
}

/// Downloads videos with the `yt-dlp` command-line tool.
#[derive(Debug, Clone, Default)]
pub struct YtDlpDownloader {
    config: YtDlpConfig,
}

impl YtDlpDownloader {
    pub fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }

    fn classify(stderr: &str) -> ServiceError {
        if let Some(marker) = PERMANENT_MARKERS
            .iter()
            .find(|m| stderr.to_lowercase().contains(&m.to_lowercase()))
        {
            return ServiceError::Unavailable((*marker).to_owned());
        }
        ServiceError::Process {
            program: "yt-dlp".into(),
            status: "failure".into(),
            stderr: stderr.to_owned(),
            retryable: true,
        }
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn download(&self, url: &str) -> Result<Bytes, ServiceError> {
        let url = validate_video_url(url)?;
        let scratch = ScratchDir::new("download")?;
        let template = scratch.join("video.%(ext)s");

        let mut args: Vec<String> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--quiet".into(),
            "-f".into(),
            self.config.format.clone(),
            "-o".into(),
            template.display().to_string(),
        ];
        match &self.config.cookies_file {
            Some(cookies) if tokio::fs::try_exists(cookies).await.unwrap_or(false) => {
                debug!(path = %cookies.display(), "using cookie file");
                args.push("--cookies".into());
                args.push(cookies.display().to_string());
            }
            Some(cookies) => {
                warn!(path = %cookies.display(), "cookie file not found, some videos may fail")
            }
            None => {}
        }
        args.push(url.to_string());

        let output = run_tool(&self.config.program, &args, self.config.timeout).await?;
        if !output.status.success() {
            return Err(Self::classify(&output.stderr_tail()));
        }

        let mut entries = tokio::fs::read_dir(scratch.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("video.") && !name.ends_with(".part") {
                let data = tokio::fs::read(entry.path()).await?;
                info!(%url, file = %name, size = data.len(), "yt-dlp download finished");
                return Ok(Bytes::from(data));
            }
        }
        Err(ServiceError::Malformed(
            "yt-dlp exited successfully but produced no video file".into(),
        ))
    }
}
