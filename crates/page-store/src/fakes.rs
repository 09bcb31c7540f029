//! In-memory page store (testing only)
//!
//! [`MemoryPageStore`] satisfies the [`PageStore`] contract without touching
//! disk, and can be told to reject writes so callers can exercise their
//! storage-failure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::{PageArtifact, PageStore, StorageError, StorageResult};

/// In-memory store backed by a `BTreeMap<index, artifact>`.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: Mutex<BTreeMap<u32, PageArtifact>>,
    reject_writes: AtomicBool,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `put` calls fail with [`StorageError::Rejected`].
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn put(&self, index: u32, payload: &[u8]) -> StorageResult<()> {
        if index == 0 {
            return Err(StorageError::InvalidIndex { index });
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected {
                index,
                reason: "writes rejected".into(),
            });
        }
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        pages.insert(
            index,
            PageArtifact {
                index,
                payload: payload.to_vec(),
                captured_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_all_ordered(&self) -> StorageResult<Vec<PageArtifact>> {
        let pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(pages.values().cloned().collect())
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn destroy(&self) -> StorageResult<()> {
        self.clear_all().await
    }
}
