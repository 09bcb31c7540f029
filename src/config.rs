//! Configuration for capture runs and merges.
//!
//! All orchestrator behaviour is controlled through [`PipelineConfig`], built
//! via its [`PipelineConfigBuilder`]. Every timing knob, retry bound and size
//! limit lives in this one struct, so a config can be shared across tasks and
//! logged as a single value.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an [`crate::orchestrator::Orchestrator`].
///
/// # Example
/// ```rust
/// use pagestitch::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .settle_delay_ms(500)
///     .max_capture_retries(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_capture_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fixed wait before quiescence polling starts, in ms. Default: 2000.
    ///
    /// Images and typeset formulae keep arriving for a while after
    /// navigation; this is the floor on how long a page gets to settle.
    pub settle_delay_ms: u64,

    /// Required silence before a page counts as rendered, in ms. Default: 2000.
    pub quiet_window_ms: u64,

    /// How often the quiescence window is re-checked, in ms. Default: 100.
    pub poll_interval_ms: u64,

    /// Extra capture attempts per page after the first failure. Default: 2.
    ///
    /// A page whose capture still fails stops the loop and is reported;
    /// the run stays active until the caller stops it.
    pub max_capture_retries: u32,

    /// Initial retry delay in ms, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Stop the loop after this many pages even if navigation reports more.
    /// Default: no cap.
    pub max_pages: Option<u32>,

    /// Largest protocol frame accepted or emitted, in bytes. Default: 64 MiB.
    pub max_message_bytes: usize,

    /// Longest title kept in a merged file name, in chars. Default: 100.
    pub title_max_len: usize,

    /// Buffered notifications per subscriber before the oldest are dropped.
    /// Default: 64.
    pub notification_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            quiet_window_ms: 2000,
            poll_interval_ms: 100,
            max_capture_retries: 2,
            retry_backoff_ms: 500,
            max_pages: None,
            max_message_bytes: 64 * 1024 * 1024,
            title_max_len: 100,
            notification_capacity: 64,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before retry `attempt` (1-based): base, 2×base, 4×base, …
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.settle_delay_ms = ms;
        self
    }

    pub fn quiet_window_ms(mut self, ms: u64) -> Self {
        self.config.quiet_window_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.max(1);
        self
    }

    pub fn max_capture_retries(mut self, n: u32) -> Self {
        self.config.max_capture_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_pages(mut self, n: Option<u32>) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn max_message_bytes(mut self, n: usize) -> Self {
        self.config.max_message_bytes = n;
        self
    }

    pub fn title_max_len(mut self, n: usize) -> Self {
        self.config.title_max_len = n.clamp(1, 200);
        self
    }

    pub fn notification_capacity(mut self, n: usize) -> Self {
        self.config.notification_capacity = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_pages == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "max_pages must be ≥ 1 when set".into(),
            ));
        }
        if c.max_message_bytes < 1024 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_message_bytes must be ≥ 1024, got {}",
                c.max_message_bytes
            )));
        }
        if c.poll_interval_ms > c.quiet_window_ms.max(1) {
            return Err(PipelineError::InvalidConfig(format!(
                "poll interval {}ms is longer than the {}ms quiet window",
                c.poll_interval_ms, c.quiet_window_ms
            )));
        }
        Ok(self.config)
    }
}
