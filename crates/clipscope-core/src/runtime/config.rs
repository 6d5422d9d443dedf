use std::time::Duration;

use crate::runtime::types::StageName;

/// Exponential backoff applied to retryable stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            factor: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scale = self.factor.max(1).saturating_pow(exp);
        self.base_delay
            .saturating_mul(scale)
            .min(self.max_delay)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Upper bound on a single attempt of each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub download: Duration,
    pub scene_extract: Duration,
    pub visual_analyze: Duration,
    pub transcribe: Duration,
    pub synthesize: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(300),
            scene_extract: Duration::from_secs(180),
            visual_analyze: Duration::from_secs(300),
            transcribe: Duration::from_secs(600),
            synthesize: Duration::from_secs(600),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageName) -> Duration {
        match stage {
            StageName::Download => self.download,
            StageName::SceneExtract => self.scene_extract,
            StageName::VisualAnalyze => self.visual_analyze,
            StageName::Transcribe => self.transcribe,
            StageName::Synthesize => self.synthesize,
        }
    }
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Bound of the submission queue.
    pub queue_capacity: usize,
    /// Jobs allowed to run stages at the same time.
    pub max_concurrent_jobs: usize,
    /// Terminal jobs kept before the oldest is evicted.
    pub retention_limit: usize,
    /// Per-job event buffer; slower subscribers are dropped.
    pub event_buffer: usize,
    pub retry: RetryPolicy,
    pub timeouts: StageTimeouts,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_concurrent_jobs: 2,
            retention_limit: 10,
            event_buffer: 16,
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
        }
    }
}
