//! Capture-run orchestration.
//!
//! [`Orchestrator`] owns the Run state and drives the per-page loop:
//!
//! ```text
//!  start(target)
//!     │  check-and-set running, clear store
//!     ▼
//!  ┌─▶ wait_ready ──▶ capture (retries) ──▶ record ──▶ advance ─┐
//!  │                                                             │ has_more
//!  └─────────────────────────────────────────────────────────────┘
//!                                                  │ !has_more
//!                                                  ▼
//!                                     Idle (store kept for merge)
//! ```
//!
//! The Run state sits behind a `std::sync::Mutex` that is never held across
//! an `.await`, so every check-and-set is atomic. Store writes go through a
//! separate async gate. A page is only recorded if its run generation is
//! still current while the gate is held, which keeps a late capture from a
//! stopped run out of a freshly cleared store. `start` and `stop` take the
//! gate before they change the generation and keep it until the store is
//! cleared.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use page_store::PageStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapter::{
    CaptureAdapter, MutationClock, NavigationAdapter, OutputSink, PageTarget, RenderReadySignal,
    SettleWindow,
};
use crate::codec::ChunkCodec;
use crate::config::PipelineConfig;
use crate::error::{AdapterError, PageError, PipelineError};
use crate::merge::{self, title_from_target};
use crate::progress::{Notification, Notifier};

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    target: Option<String>,
    last_captured_index: u32,
    pages_stored: u32,
    total: Option<u32>,
    generation: u64,
}

/// Read-only view of the Run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub running: bool,
    /// Target of the active run, or of the last one.
    pub target: Option<String>,
    /// Highest index stored during the current run (0 = none).
    pub last_captured_index: u32,
    /// Pages successfully stored during the current run.
    pub pages_stored: u32,
    /// Page count once the end of the document has been reached.
    pub total: Option<u32>,
}

/// Outcome of [`Orchestrator::request_merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    pub file_name: String,
    pub path: Option<PathBuf>,
    pub page_count: usize,
    pub skipped: Vec<PageError>,
}

/// Collaborators the page loop needs.
#[derive(Clone)]
struct Driver {
    capture: Arc<dyn CaptureAdapter>,
    navigation: Arc<dyn NavigationAdapter>,
    ready: Arc<dyn RenderReadySignal>,
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn PageStore>,
    /// `None` when pages are fed in through `record_captured_page`.
    driver: Option<Driver>,
    sink: Arc<dyn OutputSink>,
    notifier: Notifier,
    codec: ChunkCodec,
    state: Mutex<RunState>,
    store_gate: tokio::sync::Mutex<()>,
}

/// The capture-run state machine. Cheap to clone; clones share one Run.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator over `store`.
    pub fn builder(store: Arc<dyn PageStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: PipelineConfig::default(),
            store,
            capture: None,
            navigation: None,
            ready: None,
            sink: None,
            notifier: None,
            codec: None,
            external_feed: false,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.inner.codec
    }

    /// A receiver for every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let st = self.state();
        RunSnapshot {
            running: st.running,
            target: st.target.clone(),
            last_captured_index: st.last_captured_index,
            pages_stored: st.pages_stored,
            total: st.total,
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = self.state();
        st.running && st.generation == generation
    }

    // ── Run control ───────────────────────────────────────────────────────

    /// Begin a run over `target` and spawn its page loop.
    ///
    /// Returns once the store is cleared and the loop is scheduled; progress
    /// arrives through [`Self::subscribe`]. With an external feed no loop is
    /// spawned and pages arrive through [`Self::record_captured_page`].
    pub async fn start(&self, target: impl Into<String>) -> Result<(), PipelineError> {
        let target = target.into();
        // Hold the gate from publishing the new generation until the store is
        // cleared, so no page of this run can be stored before the clear.
        let gate = self.inner.store_gate.lock().await;
        let generation = {
            let mut st = self.state();
            if st.running {
                return Err(PipelineError::AlreadyRunning {
                    target: st.target.clone().unwrap_or_default(),
                });
            }
            st.running = true;
            st.generation += 1;
            st.target = Some(target.clone());
            st.last_captured_index = 0;
            st.pages_stored = 0;
            st.total = None;
            st.generation
        };

        if let Err(e) = self.inner.store.clear_all().await {
            warn!("Could not clear page store for new run: {}", e);
            let mut st = self.state();
            if st.generation == generation {
                st.running = false;
            }
            return Err(e.into());
        }
        drop(gate);

        info!("Capture run started for {}", target);
        self.inner
            .notifier
            .status(format!("Capture started: {target}"));

        if let Some(driver) = self.inner.driver.clone() {
            let this = self.clone();
            tokio::spawn(async move { this.run_loop(driver, target, generation).await });
        }
        Ok(())
    }

    /// Hard reset: mark the run idle, then clear every stored page.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let _gate = self.inner.store_gate.lock().await;
        {
            let mut st = self.state();
            if !st.running {
                return Err(PipelineError::NotRunning);
            }
            st.running = false;
            st.generation += 1;
            st.last_captured_index = 0;
            st.pages_stored = 0;
            st.total = None;
        }
        self.inner.store.clear_all().await?;

        info!("Capture run stopped; stored pages cleared");
        self.inner.notifier.publish(Notification::Stopped);
        Ok(())
    }

    /// Persist a page captured for the active run.
    ///
    /// A store failure is returned as [`PipelineError::StorageFailure`] and
    /// reported as a [`PageError::StoreFailed`] notification; the run itself
    /// carries on.
    pub async fn record_captured_page(
        &self,
        index: u32,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let generation = {
            let st = self.state();
            if !st.running {
                return Err(PipelineError::NotRunning);
            }
            st.generation
        };
        self.record(generation, index, payload).await
    }

    async fn record(
        &self,
        generation: u64,
        index: u32,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError> {
        if index == 0 {
            return Err(PipelineError::InvalidPayload {
                index,
                reason: "page indices start at 1".into(),
            });
        }
        if payload.is_empty() {
            return Err(PipelineError::InvalidPayload {
                index,
                reason: "payload is empty".into(),
            });
        }

        let len = payload.len();
        let result = {
            let _gate = self.inner.store_gate.lock().await;
            if !self.is_current(generation) {
                debug!("Discarding page {} from a finished run", index);
                return Err(PipelineError::NotRunning);
            }
            self.inner.store.put(index, &payload).await
        };

        if let Err(e) = result {
            warn!("Page {}: store write failed: {}", index, e);
            self.inner.notifier.publish(Notification::PageFailed {
                error: PageError::StoreFailed {
                    page: index,
                    detail: e.to_string(),
                },
            });
            return Err(e.into());
        }

        let (current, total) = {
            let mut st = self.state();
            if st.generation == generation {
                st.last_captured_index = st.last_captured_index.max(index);
                st.pages_stored += 1;
            }
            (st.last_captured_index, st.total.unwrap_or(0))
        };
        debug!("Page {} stored ({} bytes)", index, len);
        self.inner.notifier.progress(current, total);
        Ok(())
    }

    // ── Page loop ─────────────────────────────────────────────────────────

    async fn run_loop(self, driver: Driver, target: String, generation: u64) {
        let mut index: u32 = 1;
        loop {
            if !self.is_current(generation) {
                debug!("Run for {} superseded; page loop exits", target);
                return;
            }
            if let Some(max) = self.inner.config.max_pages {
                if index > max {
                    info!("Reached the {}-page cap", max);
                    self.complete(generation, max);
                    return;
                }
            }

            let page = PageTarget::new(target.clone(), index);
            driver.ready.wait_ready(&page).await;
            if !self.is_current(generation) {
                return;
            }

            let payload = match self
                .capture_with_retries(driver.capture.as_ref(), &page, generation)
                .await
            {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return,
                Err(e) => {
                    self.fail(generation, e);
                    return;
                }
            };

            match self.record(generation, index, payload).await {
                Ok(()) => {}
                Err(PipelineError::NotRunning) => return,
                // Reported by `record`; the run moves on to the next page.
                Err(_) => {}
            }

            let advance = match driver.navigation.advance(&page).await {
                Ok(advance) => advance,
                Err(source) => {
                    self.fail(generation, PipelineError::Navigation { index, source });
                    return;
                }
            };

            if !advance.has_more {
                self.complete(generation, index);
                return;
            }
            index += 1;
        }
    }

    /// Capture `page`, retrying with exponential backoff.
    ///
    /// `Ok(None)` means the run ended while waiting to retry.
    async fn capture_with_retries(
        &self,
        capture: &dyn CaptureAdapter,
        page: &PageTarget,
        generation: u64,
    ) -> Result<Option<Vec<u8>>, PipelineError> {
        let config = &self.inner.config;
        let mut last_err: Option<AdapterError> = None;

        for attempt in 0..=config.max_capture_retries {
            if attempt > 0 {
                let backoff = config.retry_backoff(attempt);
                warn!(
                    "Page {}: capture retry {}/{} after {}ms",
                    page.index,
                    attempt,
                    config.max_capture_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
                if !self.is_current(generation) {
                    return Ok(None);
                }
            }

            match capture.capture(page).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) => {
                    warn!("Page {}: capture attempt {} failed: {}", page.index, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        let source = last_err.unwrap_or_else(|| AdapterError::Other("unknown capture error".into()));
        let attempts = config.max_capture_retries + 1;
        self.inner.notifier.publish(Notification::PageFailed {
            error: PageError::CaptureFailed {
                page: page.index,
                attempts,
                detail: source.to_string(),
            },
        });
        Err(PipelineError::Capture {
            index: page.index,
            attempts,
            source,
        })
    }

    /// The end of the document was reached: go idle and keep the pages.
    fn complete(&self, generation: u64, last_index: u32) {
        let (current, stored) = {
            let mut st = self.state();
            if !(st.running && st.generation == generation) {
                return;
            }
            st.running = false;
            st.total = Some(last_index);
            (st.last_captured_index, st.pages_stored)
        };
        info!("Capture complete: {} page(s) stored", stored);
        self.inner.notifier.progress(current, last_index);
        self.inner
            .notifier
            .publish(Notification::Completed { pages: stored });
    }

    /// The loop cannot continue. The run stays active until `stop()`.
    fn fail(&self, generation: u64, error: PipelineError) {
        if !self.is_current(generation) {
            return;
        }
        warn!("Capture loop halted: {}", error);
        self.inner.notifier.publish(Notification::Failed {
            error: error.to_string(),
        });
    }

    // ── Merge ─────────────────────────────────────────────────────────────

    /// Merge everything in the store and hand it to the sink.
    ///
    /// Allowed whether or not a run is active. Without a title, one is
    /// derived from the run target when it looks like a library URL.
    pub async fn request_merge(&self, title: Option<&str>) -> Result<MergeSummary, PipelineError> {
        let artifacts = {
            let _gate = self.inner.store_gate.lock().await;
            self.inner.store.get_all_ordered().await?
        };
        if artifacts.is_empty() {
            return Err(PipelineError::NoPagesAvailable);
        }

        let title = title
            .map(str::to_owned)
            .or_else(|| self.state().target.as_deref().and_then(title_from_target));
        info!("Merging {} stored page(s)", artifacts.len());
        self.inner
            .notifier
            .status(format!("Merging {} page(s)", artifacts.len()));

        let max_len = self.inner.config.title_max_len;
        let merged =
            tokio::task::spawn_blocking(move || merge::merge(artifacts, title.as_deref(), max_len))
                .await
                .map_err(|e| PipelineError::Internal(format!("merge task failed: {e}")))??;

        for error in &merged.skipped {
            self.inner.notifier.publish(Notification::PageFailed {
                error: error.clone(),
            });
        }

        let merge::MergedDocument {
            bytes,
            suggested_name,
            page_count,
            skipped,
        } = merged;
        let delivery = self
            .inner
            .sink
            .deliver(bytes, &suggested_name)
            .await
            .map_err(|source| PipelineError::Sink {
                name: suggested_name.clone(),
                source,
            })?;

        self.inner
            .notifier
            .status(format!("Merged {page_count} page(s) into {}", delivery.file_name));
        Ok(MergeSummary {
            file_name: delivery.file_name,
            path: delivery.path,
            page_count,
            skipped,
        })
    }
}

/// Builder for [`Orchestrator`].
///
/// A sink is always required; capture and navigation are required unless
/// the builder is switched to an external feed. The render-ready signal
/// defaults to a [`SettleWindow`] with the config's timings.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    store: Arc<dyn PageStore>,
    capture: Option<Arc<dyn CaptureAdapter>>,
    navigation: Option<Arc<dyn NavigationAdapter>>,
    ready: Option<Arc<dyn RenderReadySignal>>,
    sink: Option<Arc<dyn OutputSink>>,
    notifier: Option<Notifier>,
    codec: Option<ChunkCodec>,
    external_feed: bool,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capture(mut self, capture: Arc<dyn CaptureAdapter>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn navigation(mut self, navigation: Arc<dyn NavigationAdapter>) -> Self {
        self.navigation = Some(navigation);
        self
    }

    /// Use one collaborator for both capture and navigation.
    pub fn source<S>(mut self, source: Arc<S>) -> Self
    where
        S: CaptureAdapter + NavigationAdapter + 'static,
    {
        self.capture = Some(source.clone() as Arc<dyn CaptureAdapter>);
        self.navigation = Some(source as Arc<dyn NavigationAdapter>);
        self
    }

    pub fn ready(mut self, ready: Arc<dyn RenderReadySignal>) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publish on an existing notifier, e.g. one the caller subscribed to
    /// before building.
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn codec(mut self, codec: ChunkCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Pages come from the caller via `record_captured_page`; `start` does
    /// not spawn a page loop.
    pub fn external_feed(mut self) -> Self {
        self.external_feed = true;
        self
    }

    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        let missing = |what: &str| PipelineError::InvalidConfig(format!("{what} is required"));
        let sink = self.sink.ok_or_else(|| missing("an output sink"))?;
        let driver = if self.external_feed {
            None
        } else {
            let config = &self.config;
            Some(Driver {
                capture: self.capture.ok_or_else(|| missing("a capture adapter"))?,
                navigation: self
                    .navigation
                    .ok_or_else(|| missing("a navigation adapter"))?,
                ready: self.ready.unwrap_or_else(|| {
                    Arc::new(SettleWindow::from_config(config, MutationClock::new()))
                }),
            })
        };
        let notifier = self
            .notifier
            .unwrap_or_else(|| Notifier::new(self.config.notification_capacity));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                codec: self.codec.unwrap_or_default(),
                config: self.config,
                store: self.store,
                driver,
                sink,
                notifier,
                state: Mutex::new(RunState::default()),
                store_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }
}
