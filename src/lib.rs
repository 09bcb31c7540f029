//! # pagestitch
//!
//! Capture a paginated document one page at a time and stitch the stored
//! page snapshots into a single PDF.
//!
//! ## Why this crate?
//!
//! Some documents are only ever shown one page at a time: a reader that
//! renders page *n*, waits for a click, then renders page *n + 1*. This crate
//! walks such a source page by page, keeps each page's PDF snapshot in a
//! durable store (so a crash or restart loses nothing already captured), and
//! merges the lot into one document on request.
//!
//! ## Pipeline Overview
//!
//! ```text
//! target
//!  │
//!  ├─ 1. Settle   wait for the page to stop changing (fixed delay + quiet window)
//!  ├─ 2. Capture  snapshot the page as a PDF (bounded retries)
//!  ├─ 3. Store    persist it under its 1-based index (page-store crate)
//!  ├─ 4. Advance  move to the next page; `has_more = false` ends the run
//!  └─ 5. Merge    on request: all stored pages, index order, one PDF (lopdf)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagestitch::adapter::{FileSink, TemplateSource};
//! use pagestitch::{FsPageStore, Notification, Orchestrator, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::builder(Arc::new(FsPageStore::open_default()))
//!         .config(PipelineConfig::default())
//!         .source(Arc::new(TemplateSource::new(30)?))
//!         .sink(Arc::new(FileSink::new("output")))
//!         .build()?;
//!
//!     let mut events = orchestrator.subscribe();
//!     orchestrator.start("https://example.com/book/page-{page}.pdf").await?;
//!     while let Ok(event) = events.recv().await {
//!         if matches!(event, Notification::Completed { .. } | Notification::Failed { .. }) {
//!             break;
//!         }
//!     }
//!
//!     let summary = orchestrator.request_merge(Some("My Book")).await?;
//!     println!("{} ({} pages)", summary.file_name, summary.page_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagestitch` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pagestitch = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod adapter;
pub mod codec;
pub mod config;
pub mod error;
pub mod merge;
pub mod message;
pub mod orchestrator;
pub mod progress;

#[cfg(test)]
mod testing;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use codec::ChunkCodec;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{AdapterError, CodecError, PageError, PipelineError};
pub use merge::{merge, MergedDocument};
pub use message::{serve, Request, Response};
pub use orchestrator::{MergeSummary, Orchestrator, OrchestratorBuilder, RunSnapshot};
pub use page_store::{FsPageStore, PageArtifact, PageStore, StorageError};
pub use progress::{Notification, Notifier};
