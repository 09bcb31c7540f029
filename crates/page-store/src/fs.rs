//! Filesystem-backed page store.
//!
//! Layout: `<root>/<collection>/page-<index:06>.rec`
//!
//! A record is a single JSON header line followed by the raw payload:
//!
//! ```text
//! {"index":3,"captured_at":"2026-01-01T00:00:00Z","len":51234}\n
//! %PDF-1.5 ... (51234 bytes)
//! ```
//!
//! Keeping header and payload in one file means one rename publishes the
//! whole record. Nothing is held open between calls: every operation
//! resolves its paths, does its I/O and lets the handles drop.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{PageArtifact, PageStore, StorageError, StorageResult, DEFAULT_COLLECTION};

const RECORD_PREFIX: &str = "page-";
const RECORD_EXT: &str = ".rec";

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    index: u32,
    captured_at: DateTime<Utc>,
    len: u64,
}

/// Durable page store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsPageStore {
    root: PathBuf,
    collection: String,
}

impl FsPageStore {
    /// Create a store rooted at `root` using `collection` as the record
    /// directory name. No I/O happens until the first operation.
    pub fn new(root: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            collection: collection.into(),
        }
    }

    /// Store under [`crate::default_store_dir`] with the default collection.
    pub fn open_default() -> Self {
        Self::new(crate::default_store_dir(), DEFAULT_COLLECTION)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Directory holding this collection's records.
    pub fn collection_dir(&self) -> PathBuf {
        self.root.join(&self.collection)
    }

    fn record_path(&self, index: u32) -> PathBuf {
        self.collection_dir()
            .join(format!("{RECORD_PREFIX}{index:06}{RECORD_EXT}"))
    }
}

#[async_trait]
impl PageStore for FsPageStore {
    async fn put(&self, index: u32, payload: &[u8]) -> StorageResult<()> {
        if index == 0 {
            return Err(StorageError::InvalidIndex { index });
        }

        let header = RecordHeader {
            index,
            captured_at: Utc::now(),
            len: payload.len() as u64,
        };
        let mut record = serde_json::to_vec(&header)?;
        record.push(b'\n');
        record.extend_from_slice(payload);

        let dir = self.collection_dir();
        let path = self.record_path(index);

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &record))
            .await
            .map_err(|e| StorageError::Internal(format!("write task failed: {e}")))??;

        debug!("Stored page {} ({} bytes)", index, payload.len());
        Ok(())
    }

    async fn get_all_ordered(&self) -> StorageResult<Vec<PageArtifact>> {
        let dir = self.collection_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io { path: dir, source: e }),
        };

        let mut pages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io {
                path: dir.clone(),
                source: e,
            })?
        {
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                // Cleared underneath us; nothing to return for it.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io { path, source: e }),
            };

            match parse_record(bytes) {
                Ok(artifact) => pages.push(artifact),
                Err(detail) => warn!("Skipping corrupt page record {}: {}", path.display(), detail),
            }
        }

        pages.sort_by_key(|p| p.index);
        debug!("Loaded {} page records from {}", pages.len(), dir.display());
        Ok(pages)
    }

    async fn clear_all(&self) -> StorageResult<()> {
        let dir = self.collection_dir();
        remove_dir_if_present(&dir).await?;
        info!("Cleared page collection '{}'", self.collection);
        Ok(())
    }

    async fn destroy(&self) -> StorageResult<()> {
        remove_dir_if_present(&self.root).await?;
        info!("Destroyed page store at {}", self.root.display());
        Ok(())
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────────

/// Write `data` to `path` through a temp file in the same directory, so a
/// crash mid-write never leaves a truncated record behind.
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> StorageResult<()> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(data).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(RECORD_PREFIX) && n.ends_with(RECORD_EXT))
        .unwrap_or(false)
}

fn parse_record(mut bytes: Vec<u8>) -> Result<PageArtifact, String> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| "missing header line".to_string())?;

    let header: RecordHeader = serde_json::from_slice(&bytes[..newline])
        .map_err(|e| format!("bad header: {e}"))?;

    let payload = bytes.split_off(newline + 1);
    if payload.len() as u64 != header.len {
        return Err(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.len
        ));
    }
    if header.index == 0 {
        return Err("index 0 in header".to_string());
    }

    Ok(PageArtifact {
        index: header.index,
        payload,
        captured_at: header.captured_at,
    })
}

async fn remove_dir_if_present(dir: &Path) -> StorageResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}
