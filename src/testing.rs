//! Collaborator fakes shared by the unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use page_store::fakes::MemoryPageStore;
use page_store::{PageArtifact, PageStore, StorageResult};
use tokio::sync::Notify;

use crate::adapter::fakes::MemorySink;
use crate::adapter::{Advance, CaptureAdapter, Immediate, NavigationAdapter, PageTarget};
use crate::error::AdapterError;
use crate::orchestrator::Orchestrator;

/// Never finishes a capture, so a started run stays active.
pub struct Stalled;

#[async_trait]
impl CaptureAdapter for Stalled {
    async fn capture(&self, _page: &PageTarget) -> Result<Vec<u8>, AdapterError> {
        std::future::pending::<Result<Vec<u8>, AdapterError>>().await
    }
}

#[async_trait]
impl NavigationAdapter for Stalled {
    async fn advance(&self, _page: &PageTarget) -> Result<Advance, AdapterError> {
        Ok(Advance { has_more: true })
    }
}

/// An orchestrator whose loop never gets past the first capture, so pages
/// are fed in through `record_captured_page`.
pub fn stalled(store: Arc<MemoryPageStore>, sink: Arc<MemorySink>) -> Orchestrator {
    Orchestrator::builder(store)
        .source(Arc::new(Stalled))
        .ready(Arc::new(Immediate))
        .sink(sink)
        .build()
        .unwrap()
}

/// Memory store whose `clear_all` signals `clearing`, then waits for
/// `release` before clearing.
#[derive(Default)]
pub struct SlowClear {
    pub inner: MemoryPageStore,
    pub clearing: Notify,
    pub release: Notify,
}

#[async_trait]
impl PageStore for SlowClear {
    async fn put(&self, index: u32, payload: &[u8]) -> StorageResult<()> {
        self.inner.put(index, payload).await
    }

    async fn get_all_ordered(&self) -> StorageResult<Vec<PageArtifact>> {
        self.inner.get_all_ordered().await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.clearing.notify_one();
        self.release.notified().await;
        self.inner.clear_all().await
    }

    async fn destroy(&self) -> StorageResult<()> {
        self.inner.destroy().await
    }
}
