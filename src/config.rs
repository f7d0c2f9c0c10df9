//! Engine configuration.
//!
//! All tunables live in one [`PipelineConfig`] passed to the workflow at
//! construction. It can be built in code or loaded from TOML:
//!
//! ```toml
//! max_chunk_size = 2000
//! chunk_overlap = 200
//! max_revisions = 3
//! concurrency_limit = 2
//! stage_order = ["writer", "visualizer", "sound_designer", "reviewer"]
//!
//! [default_policy]
//! timeout_ms = 120000
//! retry_limit = 2
//!
//! [stages.visualizer]
//! timeout_ms = 300000
//! retry_limit = 4
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry2::strategy::{jitter, ExponentialBackoff};

use crate::{ReelError, Result, StageId, StageOrder};

/// Timeout, retry and backoff settings for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// Time budget for a single invocation, in milliseconds.
    pub timeout_ms: u64,
    /// Extra attempts after the first failure.
    pub retry_limit: u32,
    /// Delay before the first retry, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound for any single retry delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Randomize retry delays.
    pub jitter: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            retry_limit: 2,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            jitter: true,
        }
    }
}

impl StagePolicy {
    /// Invocation timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delays to wait before each retry, at most `retry_limit` of them.
    pub fn backoff(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        // ExponentialBackoff yields 2^n * factor ms, so halving the base
        // makes the first delay equal to backoff_base_ms.
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.backoff_base_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.backoff_max_ms))
            .take(self.retry_limit as usize);
        if self.jitter {
            Box::new(strategy.map(jitter))
        } else {
            Box::new(strategy)
        }
    }
}

/// Configuration surface consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum chunk length in characters.
    pub max_chunk_size: usize,
    /// Characters of the next chunk handed to stages as a lookahead.
    pub chunk_overlap: usize,
    /// How many times the reviewer may send a chunk back. 0 disables
    /// revision.
    pub max_revisions: u32,
    /// Stage execution order; must end with `reviewer`.
    pub stage_order: Vec<StageId>,
    /// Maximum number of chunks in flight at once.
    pub concurrency_limit: usize,
    /// Policy for stages without an explicit entry in `stages`.
    pub default_policy: StagePolicy,
    /// Per-stage overrides.
    pub stages: HashMap<StageId, StagePolicy>,
    /// Upper bound on how long a progress sink may hold up the engine.
    pub reporter_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 2000,
            chunk_overlap: 200,
            max_revisions: 3,
            stage_order: vec![
                StageId::Writer,
                StageId::Visualizer,
                StageId::SoundDesigner,
                StageId::Reviewer,
            ],
            concurrency_limit: 1,
            default_policy: StagePolicy::default(),
            stages: HashMap::new(),
            reporter_timeout_ms: 500,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// Missing keys fall back to [`PipelineConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Configuration`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(ReelError::Configuration(
                "max_chunk_size must be positive".to_string(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(ReelError::Configuration(
                "concurrency_limit must be positive".to_string(),
            ));
        }
        let order = StageOrder::new(&self.stage_order)?;
        for (stage, policy) in &self.stages {
            if !order.contains(*stage) {
                return Err(ReelError::Configuration(format!(
                    "policy given for {} which is not in stage_order",
                    stage
                )));
            }
            Self::validate_policy(stage.as_str(), policy)?;
        }
        Self::validate_policy("default_policy", &self.default_policy)?;
        Ok(())
    }

    fn validate_policy(stage: &str, policy: &StagePolicy) -> Result<()> {
        if policy.timeout_ms == 0 {
            return Err(ReelError::Configuration(format!(
                "timeout for {} must be positive",
                stage
            )));
        }
        if policy.backoff_max_ms < policy.backoff_base_ms {
            return Err(ReelError::Configuration(format!(
                "backoff_max_ms for {} is below backoff_base_ms",
                stage
            )));
        }
        Ok(())
    }

    /// The effective policy for `stage`.
    pub fn policy(&self, stage: StageId) -> &StagePolicy {
        self.stages.get(&stage).unwrap_or(&self.default_policy)
    }

    /// Reporter timeout as a [`Duration`].
    pub fn reporter_timeout(&self) -> Duration {
        Duration::from_millis(self.reporter_timeout_ms)
    }
}
