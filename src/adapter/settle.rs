//! Render-ready signals.
//!
//! A freshly navigated page keeps changing for a while: images decode, math
//! is typeset, lazy sections load. [`SettleWindow`] waits a fixed delay and
//! then polls until nothing has changed for a quiet window. Whoever observes
//! the page reports changes by calling [`MutationClock::touch`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{PageTarget, RenderReadySignal};
use crate::config::PipelineConfig;

/// Timestamp of the most recent observed change.
#[derive(Debug, Clone)]
pub struct MutationClock {
    tx: Arc<watch::Sender<Instant>>,
}

impl Default for MutationClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationClock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Instant::now());
        Self { tx: Arc::new(tx) }
    }

    /// Record a change at the current instant.
    pub fn touch(&self) {
        self.tx.send_replace(Instant::now());
    }

    pub fn last_change(&self) -> Instant {
        *self.tx.borrow()
    }
}

/// Fixed settle delay followed by a quiescence window.
#[derive(Debug, Clone)]
pub struct SettleWindow {
    delay: Duration,
    quiet: Duration,
    poll: Duration,
    clock: MutationClock,
}

impl SettleWindow {
    pub fn new(delay: Duration, quiet: Duration, poll: Duration, clock: MutationClock) -> Self {
        Self {
            delay,
            quiet,
            poll: poll.max(Duration::from_millis(1)),
            clock,
        }
    }

    /// Window with the config's timings, watching `clock`.
    pub fn from_config(config: &PipelineConfig, clock: MutationClock) -> Self {
        Self::new(
            config.settle_delay(),
            config.quiet_window(),
            config.poll_interval(),
            clock,
        )
    }

    pub fn clock(&self) -> &MutationClock {
        &self.clock
    }
}

#[async_trait]
impl RenderReadySignal for SettleWindow {
    async fn wait_ready(&self, page: &PageTarget) {
        let started = Instant::now();
        // Silence is measured from the start of the wait.
        self.clock.touch();
        sleep(self.delay).await;

        loop {
            let silent_for = Instant::now().saturating_duration_since(self.clock.last_change());
            if silent_for >= self.quiet {
                break;
            }
            sleep(self.poll).await;
        }

        debug!(
            "Page {} settled after {}ms",
            page.index,
            started.elapsed().as_millis()
        );
    }
}

/// Signal that is always ready. For sources that hand over finished files.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

#[async_trait]
impl RenderReadySignal for Immediate {
    async fn wait_ready(&self, _page: &PageTarget) {}
}
