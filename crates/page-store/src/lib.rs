//! # page-store
//!
//! Durable, index-keyed storage for captured page artifacts.
//!
//! A capture run produces one binary snapshot per source page. Each snapshot
//! is stored under its 1-based page index so that a later merge can rebuild
//! the whole document in order, even if the capturing process was suspended
//! or restarted between pages.
//!
//! ## Contract
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`PageStore::put`] | upsert one artifact; same index replaces |
//! | [`PageStore::get_all_ordered`] | every artifact, ascending by index; empty is fine |
//! | [`PageStore::clear_all`] | remove every artifact; idempotent |
//! | [`PageStore::destroy`] | remove the whole persisted store |
//!
//! Artifacts are never deleted individually.
//!
//! ## Backends
//!
//! - [`FsPageStore`]: one record file per page under
//!   `<root>/<collection>/page-<index>.rec`, written atomically.
//! - [`fakes::MemoryPageStore`]: in-memory store for tests.
//!
//! ## Environment variable overrides
//!
//! - `PAGESTITCH_STORE_DIR`: root directory used by [`default_store_dir`].

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod fakes;
mod fs;

pub use fs::FsPageStore;

// ── Public constants ─────────────────────────────────────────────────────────

/// Collection name used when the caller does not pick one.
pub const DEFAULT_COLLECTION: &str = "pdf_pages";

/// Environment variable that overrides [`default_store_dir`].
pub const STORE_DIR_ENV: &str = "PAGESTITCH_STORE_DIR";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by page store operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Page indices are 1-based.
    #[error("Invalid page index {index}: indices start at 1")]
    InvalidIndex { index: u32 },

    /// The filesystem rejected a read or write.
    #[error("Storage I/O failed at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record header could not be encoded.
    #[error("Failed to encode record header: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused the write (fault injection, quota, ...).
    #[error("Write rejected for page {index}: {reason}")]
    Rejected { index: u32, reason: String },

    /// A blocking storage task panicked or was cancelled.
    #[error("Internal storage error: {0}")]
    Internal(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ── Records ──────────────────────────────────────────────────────────────────

/// One persisted page snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageArtifact {
    /// 1-based page index; the sort and merge key.
    pub index: u32,
    /// Opaque binary snapshot (normally a self-contained PDF).
    pub payload: Vec<u8>,
    /// When the artifact was written.
    pub captured_at: DateTime<Utc>,
}

// ── Store boundary ───────────────────────────────────────────────────────────

/// Index-keyed artifact store.
///
/// Implementations must be `Send + Sync`; the capture loop and merge requests
/// run on different tokio tasks.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Store `payload` under `index`, replacing any artifact already there.
    async fn put(&self, index: u32, payload: &[u8]) -> StorageResult<()>;

    /// Every stored artifact, sorted ascending by index.
    async fn get_all_ordered(&self) -> StorageResult<Vec<PageArtifact>>;

    /// Remove every artifact. Succeeds when the store is already empty.
    async fn clear_all(&self) -> StorageResult<()>;

    /// Remove the persisted store entirely.
    async fn destroy(&self) -> StorageResult<()>;
}

// ── Store directory resolution ───────────────────────────────────────────────

/// Returns the root directory for persisted page stores.
///
/// Default locations:
/// - **macOS**: `~/Library/Application Support/pagestitch/`
/// - **Linux**: `~/.local/share/pagestitch/`
/// - **Windows**: `%LOCALAPPDATA%\pagestitch\`
///
/// Override by setting `PAGESTITCH_STORE_DIR`.
pub fn default_store_dir() -> PathBuf {
    if let Ok(override_dir) = std::env::var(STORE_DIR_ENV) {
        if !override_dir.is_empty() {
            return PathBuf::from(override_dir);
        }
    }

    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("pagestitch")
}
