use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::services::process::{ScratchDir, run_tool};
use crate::services::{SceneDetector, SceneFrame, ServiceError};

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub program: String,
    /// Scene change score (0..1) above which a frame starts a new scene.
    pub scene_threshold: f64,
    pub max_keyframes: usize,
    /// Keyframes are scaled to this width, keeping aspect ratio.
    pub frame_width: u32,
    pub timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            scene_threshold: 0.3,
            max_keyframes: 24,
            frame_width: 640,
            timeout: Duration::from_secs(170),
        }
    }
}

/// Detects scene cuts with ffmpeg's `scene` score and keeps the first frame
/// of every scene (the very first frame of the video included).
#[derive(Debug, Clone, Default)]
pub struct FfmpegSceneDetector {
    config: FfmpegConfig,
}

impl FfmpegSceneDetector {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    fn filter(&self) -> String {
        format!(
            "select='eq(n\\,0)+gt(scene\\,{})',showinfo,scale={}:-2",
            self.config.scene_threshold, self.config.frame_width
        )
    }
}

/// `pts_time` of every frame reported by the `showinfo` filter, in order.
fn parse_showinfo(stderr: &str) -> Vec<f64> {
    stderr
        .lines()
        .filter(|line| line.contains("Parsed_showinfo"))
        .filter_map(|line| {
            let rest = &line[line.find("pts_time:")? + "pts_time:".len()..];
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
        .collect()
}

#[async_trait]
impl SceneDetector for FfmpegSceneDetector {
    async fn detect(&self, video: Bytes) -> Result<Vec<SceneFrame>, ServiceError> {
        let scratch = ScratchDir::new("scenes")?;
        let input = scratch.join("input.mp4");
        tokio::fs::write(&input, &video).await?;

        let pattern = scratch.join("frame_%04d.jpg");
        let args = [
            "-hide_banner".to_owned(),
            "-nostdin".to_owned(),
            "-i".to_owned(),
            input.display().to_string(),
            "-vf".to_owned(),
            self.filter(),
            "-vsync".to_owned(),
            "vfr".to_owned(),
            "-frames:v".to_owned(),
            self.config.max_keyframes.to_string(),
            "-q:v".to_owned(),
            "3".to_owned(),
            pattern.display().to_string(),
        ];
        let output = run_tool(&self.config.program, &args, self.config.timeout)
            .await?
            .check(&self.config.program, false)?;

        let timestamps = parse_showinfo(&output.stderr);
        let mut frames = Vec::with_capacity(timestamps.len());
        for (i, timestamp_secs) in timestamps.into_iter().enumerate() {
            let index = i + 1;
            let path = scratch.join(&format!("frame_{index:04}.jpg"));
            match tokio::fs::read(&path).await {
                Ok(image) => frames.push(SceneFrame {
                    index,
                    timestamp_secs,
                    image: Bytes::from(image),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(index, "showinfo reported more frames than were written");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(scenes = frames.len(), "scene detection finished");
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pts_time_from_showinfo() {
        let stderr = "\
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'input.mp4':
[Parsed_showinfo_1 @ 0x600000d2c000] n:   0 pts:      0 pts_time:0       duration:512
[Parsed_showinfo_1 @ 0x600000d2c000] n:   1 pts: 123904 pts_time:8.06667 duration:512
[Parsed_showinfo_1 @ 0x600000d2c000] n:   2 pts: 201216 pts_time:13.1    duration:512
frame=    3 fps=0.0 q=3.0 Lsize=N/A time=00:00:13.13";
        assert_eq!(parse_showinfo(stderr), vec![0.0, 8.06667, 13.1]);
    }

    #[test]
    fn filter_selects_first_frame_and_scene_cuts() {
        let detector = FfmpegSceneDetector::new(FfmpegConfig {
            scene_threshold: 0.4,
            frame_width: 480,
            ..FfmpegConfig::default()
        });
        assert_eq!(
            detector.filter(),
            "select='eq(n\\,0)+gt(scene\\,0.4)',showinfo,scale=480:-2"
        );
    }
}
