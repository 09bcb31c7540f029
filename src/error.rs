//! Error types for the pagestitch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **fatal for the call**. The requested operation
//!   cannot proceed (a run is already active, nothing to merge, the sink
//!   refused the output). Returned as `Err(PipelineError)` from the
//!   [`crate::orchestrator::Orchestrator`] operations.
//!
//! * [`PageError`]: **non-fatal**. A single page failed (its store write was
//!   rejected, its artifact would not parse) but the run or merge carries on.
//!   Reported through notifications and collected in
//!   [`crate::merge::MergedDocument::skipped`] so callers can see exactly
//!   which pages are missing from the output.
//!
//! Collaborator failures arrive as [`AdapterError`] and are wrapped into the
//! matching [`PipelineError`] variant by the orchestrator.

use page_store::StorageError;
use thiserror::Error;

/// All call-level errors returned by the pagestitch library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Run-state errors ──────────────────────────────────────────────────
    /// `start` was called while a run is active.
    #[error("A capture run is already in progress (target '{target}')")]
    AlreadyRunning { target: String },

    /// `stop` or a page record arrived while no run is active.
    #[error("No capture run is in progress")]
    NotRunning,

    // ── Capture-path errors ───────────────────────────────────────────────
    /// A captured page was empty or addressed to index 0.
    #[error("Invalid payload for page {index}: {reason}")]
    InvalidPayload { index: u32, reason: String },

    /// The page store rejected an operation.
    #[error("Page store failure: {0}")]
    StorageFailure(#[from] StorageError),

    /// The capture collaborator could not produce a snapshot.
    #[error("Capture failed for page {index} after {attempts} attempt(s): {source}")]
    Capture {
        index: u32,
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    /// The navigation collaborator could not advance past a page.
    #[error("Navigation failed after page {index}: {source}")]
    Navigation {
        index: u32,
        #[source]
        source: AdapterError,
    },

    // ── Merge errors ──────────────────────────────────────────────────────
    /// The store held no artifacts when a merge was requested.
    #[error("No captured pages are available to merge")]
    NoPagesAvailable,

    /// The merge could not produce a document.
    #[error("Merge failed: {0}")]
    MergeFailure(String),

    /// The output sink refused the merged document.
    #[error("Output sink rejected '{name}': {source}")]
    Sink {
        name: String,
        #[source]
        source: AdapterError,
    },

    // ── Transport errors ──────────────────────────────────────────────────
    /// A transported payload could not be decoded or encoded.
    #[error("Payload encoding error: {0}")]
    Codec(#[from] CodecError),

    /// A protocol frame exceeded the configured size limit.
    #[error("Message of {size} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// A protocol frame is not a known request.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Reading or writing the protocol stream failed.
    #[error("Protocol stream error: {0}")]
    Io(#[from] std::io::Error),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PageError {
    /// The page was captured but its store write failed.
    #[error("Page {page}: store write failed: {detail}")]
    StoreFailed { page: u32, detail: String },

    /// The capture collaborator gave up on the page.
    #[error("Page {page}: capture failed after {attempts} attempt(s): {detail}")]
    CaptureFailed {
        page: u32,
        attempts: u32,
        detail: String,
    },

    /// The stored artifact is not a parseable document fragment.
    #[error("Page {page}: artifact could not be parsed: {detail}")]
    ParseFailed { page: u32, detail: String },
}

impl PageError {
    /// The 1-based page index this error belongs to.
    pub fn page(&self) -> u32 {
        match self {
            PageError::StoreFailed { page, .. }
            | PageError::CaptureFailed { page, .. }
            | PageError::ParseFailed { page, .. } => *page,
        }
    }
}

/// Failure reported by an external collaborator (capture, navigation, sink).
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The collaborator could not reach its resource.
    #[error("'{resource}' is unavailable: {reason}")]
    Unavailable { resource: String, reason: String },

    /// The collaborator produced bytes that are not a PDF.
    #[error("'{resource}' is not a PDF (first bytes: {magic:?})")]
    NotAPdf { resource: String, magic: Vec<u8> },

    /// The page template cannot address pages.
    #[error("Invalid page template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Local I/O failed.
    #[error("I/O error on '{resource}': {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    /// Anything else a collaborator wants to report.
    #[error("{0}")]
    Other(String),
}

/// Errors from the binary chunk codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A chunk still exceeded the fragment limit at the smallest granularity.
    #[error("{chunk_len}-byte chunk at offset {offset} exceeds the {limit}-char fragment limit at the smallest granularity")]
    FragmentTooLarge {
        offset: usize,
        chunk_len: usize,
        limit: usize,
    },

    /// The chunk ladder is unusable.
    #[error("Invalid chunk ladder: {0}")]
    InvalidLadder(String),

    /// The text is not valid standard base64.
    #[error("Invalid encoded payload at char {offset}: {detail}")]
    InvalidEncoding { offset: usize, detail: String },
}
