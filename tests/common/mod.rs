//! Deterministic collaborators and PDF fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use page_store::fakes::MemoryPageStore;
use page_store::{PageArtifact, PageStore, StorageError, StorageResult};
use pagestitch::adapter::{Advance, CaptureAdapter, NavigationAdapter, PageTarget};
use pagestitch::{AdapterError, Notification};
use tokio::sync::{broadcast, Notify};

// ── PDF fixtures ─────────────────────────────────────────────────────────────

/// A valid PDF with `pages` pages, page *n* drawing `"<label> p<n>"`.
pub fn pdf_with_pages(label: &str, pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids = Vec::new();
    for n in 1..=pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 18.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(format!("{label} p{n}"))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

pub fn page_count(bytes: &[u8]) -> usize {
    Document::load_mem(bytes).unwrap().get_pages().len()
}

// ── Scripted source ──────────────────────────────────────────────────────────

/// Capture + navigation over a fixed list of page payloads.
///
/// Page *n* is `pages[n - 1]`; navigation reports the end after the last one.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Vec<Vec<u8>>,
    /// Remaining forced failures per page index.
    failures: Mutex<HashMap<u32, u32>>,
    /// Pages whose capture waits for `release`.
    held: HashSet<u32>,
    pub entered: Notify,
    pub release: Notify,
    pub captures: AtomicU32,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Vec<u8>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    /// Fail the capture of `index` `times` times before succeeding.
    pub fn failing(self, index: u32, times: u32) -> Self {
        self.failures.lock().unwrap().insert(index, times);
        self
    }

    /// Block the capture of `index` until `release` is notified.
    pub fn holding(mut self, index: u32) -> Self {
        self.held.insert(index);
        self
    }
}

#[async_trait]
impl CaptureAdapter for ScriptedSource {
    async fn capture(&self, page: &PageTarget) -> Result<Vec<u8>, AdapterError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.held.contains(&page.index) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&page.index) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AdapterError::Unavailable {
                        resource: format!("{}#{}", page.target, page.index),
                        reason: "scripted failure".into(),
                    });
                }
            }
        }

        self.pages
            .get(page.index as usize - 1)
            .cloned()
            .ok_or_else(|| AdapterError::Other(format!("no page {}", page.index)))
    }
}

#[async_trait]
impl NavigationAdapter for ScriptedSource {
    async fn advance(&self, page: &PageTarget) -> Result<Advance, AdapterError> {
        Ok(Advance {
            has_more: (page.index as usize) < self.pages.len(),
        })
    }
}

// ── Stores ───────────────────────────────────────────────────────────────────

/// Memory store that refuses writes for chosen indices.
pub struct FlakyStore {
    pub inner: MemoryPageStore,
    reject: HashSet<u32>,
}

impl FlakyStore {
    pub fn rejecting(indices: &[u32]) -> Self {
        Self {
            inner: MemoryPageStore::new(),
            reject: indices.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl PageStore for FlakyStore {
    async fn put(&self, index: u32, payload: &[u8]) -> StorageResult<()> {
        if self.reject.contains(&index) {
            return Err(StorageError::Rejected {
                index,
                reason: "quota exceeded".into(),
            });
        }
        self.inner.put(index, payload).await
    }

    async fn get_all_ordered(&self) -> StorageResult<Vec<PageArtifact>> {
        self.inner.get_all_ordered().await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.inner.clear_all().await
    }

    async fn destroy(&self) -> StorageResult<()> {
        self.inner.destroy().await
    }
}

// ── Notification helpers ─────────────────────────────────────────────────────

/// Collect notifications until `done` matches one (inclusive).
pub async fn collect_until(
    rx: &mut broadcast::Receiver<Notification>,
    done: impl Fn(&Notification) -> bool,
) -> Vec<Notification> {
    let mut seen = Vec::new();
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(n) => {
                    let stop = done(&n);
                    seen.push(n);
                    if stop {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for notification");
    seen
}

pub fn is_terminal(n: &Notification) -> bool {
    matches!(
        n,
        Notification::Completed { .. } | Notification::Failed { .. } | Notification::Stopped
    )
}
