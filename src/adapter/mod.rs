//! Boundaries to the collaborators the orchestrator drives but does not own.
//!
//! Each collaborator is an injected trait object, so the state machine can
//! run against a live source or against deterministic fakes:
//!
//! ```text
//!            ┌──────────────┐   wait_ready   ┌────────────────────┐
//!            │              │ ─────────────▶ │ RenderReadySignal  │
//!            │              │    capture     ├────────────────────┤
//!            │ Orchestrator │ ─────────────▶ │ CaptureAdapter     │
//!            │              │    advance     ├────────────────────┤
//!            │              │ ─────────────▶ │ NavigationAdapter  │
//!            │              │    deliver     ├────────────────────┤
//!            │              │ ─────────────▶ │ OutputSink         │
//!            └──────────────┘                └────────────────────┘
//! ```
//!
//! Shipped implementations:
//! - [`source`]: capture + navigation over a `{page}` template (HTTP or files)
//! - [`settle`]: fixed delay + quiescence window render-ready signal
//! - [`sink`]: atomic file sink and in-band message sink
//! - [`fakes`]: in-memory sink for tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::AdapterError;

pub mod fakes;
pub mod settle;
pub mod sink;
pub mod source;

pub use settle::{Immediate, MutationClock, SettleWindow};
pub use sink::{DownloadFrames, FileSink, MessageSink};
pub use source::TemplateSource;

/// The handle passed to collaborators: which document, which page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageTarget {
    /// Opaque identifier of the document being captured.
    pub target: String,
    /// 1-based index of the page the collaborator should act on.
    pub index: u32,
}

impl PageTarget {
    pub fn new(target: impl Into<String>, index: u32) -> Self {
        Self {
            target: target.into(),
            index,
        }
    }
}

/// Result of one navigation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advance {
    /// `false` is the authoritative end-of-document signal.
    pub has_more: bool,
}

/// Where a merged document ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Final file name used by the sink.
    pub file_name: String,
    /// Local path, when the sink wrote one.
    pub path: Option<PathBuf>,
}

/// Produces a binary snapshot (a self-contained PDF) of the current page.
#[async_trait]
pub trait CaptureAdapter: Send + Sync {
    async fn capture(&self, page: &PageTarget) -> Result<Vec<u8>, AdapterError>;
}

/// Moves the source past `page` and reports whether another page follows.
#[async_trait]
pub trait NavigationAdapter: Send + Sync {
    async fn advance(&self, page: &PageTarget) -> Result<Advance, AdapterError>;
}

/// Resolves once the page's visual state has stopped changing.
#[async_trait]
pub trait RenderReadySignal: Send + Sync {
    async fn wait_ready(&self, page: &PageTarget);
}

/// Accepts the merged document. Where it goes is the sink's business.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<Delivery, AdapterError>;
}
