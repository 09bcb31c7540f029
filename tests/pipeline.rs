//! Integration tests for capture runs and merges.
//!
//! Every collaborator is a deterministic fake from `common`, so these run
//! without network access or a browser.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    collect_until, is_terminal, page_count, pdf_with_pages, FlakyStore, ScriptedSource,
};
use page_store::fakes::MemoryPageStore;
use pagestitch::adapter::fakes::MemorySink;
use pagestitch::adapter::{Immediate, MessageSink};
use pagestitch::{
    serve, ChunkCodec, FsPageStore, Notification, Orchestrator, PageError, PageStore,
    PipelineConfig, PipelineError,
};
use regex::Regex;

fn fast_config() -> PipelineConfig {
    PipelineConfig::builder().retry_backoff_ms(1).build().unwrap()
}

fn orchestrator(
    store: Arc<dyn PageStore>,
    source: Arc<ScriptedSource>,
    sink: Arc<MemorySink>,
    config: PipelineConfig,
) -> Orchestrator {
    Orchestrator::builder(store)
        .config(config)
        .source(source)
        .ready(Arc::new(Immediate))
        .sink(sink)
        .build()
        .unwrap()
}

// ── End to end ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn captured_pages_merge_into_one_named_pdf() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsPageStore::new(dir.path(), "pdf_pages"));
    let source = Arc::new(ScriptedSource::new(vec![
        pdf_with_pages("one", 2),
        pdf_with_pages("two", 3),
    ]));
    let sink = Arc::new(MemorySink::new());
    let orch = orchestrator(store.clone(), source, sink.clone(), fast_config());
    let mut rx = orch.subscribe();

    orch.start("doc-X").await.unwrap();
    let events = collect_until(&mut rx, is_terminal).await;
    assert_eq!(events.last(), Some(&Notification::Completed { pages: 2 }));
    assert!(events.contains(&Notification::Progress { current: 1, total: 0 }));
    assert!(events.contains(&Notification::Progress { current: 2, total: 2 }));

    let snap = orch.snapshot();
    assert!(!snap.running);
    assert_eq!(snap.total, Some(2));
    assert_eq!(snap.last_captured_index, 2);

    // Completion keeps the pages on disk for the merge.
    assert_eq!(store.get_all_ordered().await.unwrap().len(), 2);

    let summary = orch.request_merge(Some("My Book")).await.unwrap();
    assert_eq!(summary.page_count, 5);
    assert!(summary.skipped.is_empty());

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    let pattern = Regex::new(r"^My_Book_\d{8}_\d{6}\.pdf$").unwrap();
    let name = &delivered[0].file_name;
    assert!(pattern.is_match(name), "unexpected name {name}");
    assert_eq!(name, &summary.file_name);
    assert_eq!(page_count(&delivered[0].bytes), 5);
}

#[tokio::test]
async fn merge_without_title_uses_generic_name() {
    let store = Arc::new(MemoryPageStore::new());
    let source = Arc::new(ScriptedSource::new(vec![pdf_with_pages("a", 1)]));
    let sink = Arc::new(MemorySink::new());
    let orch = orchestrator(store, source, sink, fast_config());
    let mut rx = orch.subscribe();

    orch.start("doc-X").await.unwrap();
    collect_until(&mut rx, is_terminal).await;

    let summary = orch.request_merge(None).await.unwrap();
    assert!(summary.file_name.starts_with("merged_"), "{}", summary.file_name);
}

// ── Run-state rules ──────────────────────────────────────────────────────────

#[tokio::test]
async fn a_second_run_is_rejected_while_one_is_active() {
    let store = Arc::new(MemoryPageStore::new());
    let source = Arc::new(ScriptedSource::new(vec![pdf_with_pages("a", 1)]).holding(1));
    let orch = orchestrator(
        store,
        source.clone(),
        Arc::new(MemorySink::new()),
        fast_config(),
    );

    orch.start("doc-A").await.unwrap();
    source.entered.notified().await;

    let err = orch.start("doc-B").await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning { .. }));
    assert_eq!(orch.snapshot().target.as_deref(), Some("doc-A"));
    assert_eq!(orch.snapshot().last_captured_index, 0);
}

#[tokio::test]
async fn stopping_an_idle_orchestrator_changes_nothing() {
    let store = Arc::new(MemoryPageStore::new());
    store.put(4, b"left over").await.unwrap();
    let orch = orchestrator(
        store.clone(),
        Arc::new(ScriptedSource::default()),
        Arc::new(MemorySink::new()),
        fast_config(),
    );

    assert!(matches!(orch.stop().await, Err(PipelineError::NotRunning)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn a_new_run_never_sees_the_previous_runs_pages() {
    let store = Arc::new(MemoryPageStore::new());
    let orch = Orchestrator::builder(store.clone())
        .external_feed()
        .sink(Arc::new(MemorySink::new()))
        .build()
        .unwrap();

    orch.start("doc-A").await.unwrap();
    orch.record_captured_page(1, pdf_with_pages("a", 1))
        .await
        .unwrap();
    orch.stop().await.unwrap();
    orch.start("doc-B").await.unwrap();

    assert!(matches!(
        orch.request_merge(None).await,
        Err(PipelineError::NoPagesAvailable)
    ));
}

#[tokio::test]
async fn stop_discards_a_capture_still_in_flight() {
    let store = Arc::new(MemoryPageStore::new());
    let source = Arc::new(ScriptedSource::new(vec![pdf_with_pages("a", 1)]).holding(1));
    let orch = orchestrator(
        store.clone(),
        source.clone(),
        Arc::new(MemorySink::new()),
        fast_config(),
    );
    let mut rx = orch.subscribe();

    orch.start("doc").await.unwrap();
    source.entered.notified().await;
    orch.stop().await.unwrap();
    source.release.notify_one();

    // Give the loop a chance to (wrongly) record the page.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.is_empty());

    let events = collect_until(&mut rx, is_terminal).await;
    assert!(events
        .iter()
        .all(|n| !matches!(n, Notification::Progress { .. })));
    assert_eq!(events.last(), Some(&Notification::Stopped));
}

// ── Partial failure ──────────────────────────────────────────────────────────

#[tokio::test]
async fn a_rejected_store_write_does_not_halt_the_run() {
    let store = Arc::new(FlakyStore::rejecting(&[2]));
    let source = Arc::new(ScriptedSource::new(vec![
        pdf_with_pages("a", 1),
        pdf_with_pages("b", 1),
        pdf_with_pages("c", 1),
    ]));
    let sink = Arc::new(MemorySink::new());
    let orch = orchestrator(store.clone(), source, sink, fast_config());
    let mut rx = orch.subscribe();

    orch.start("doc").await.unwrap();
    let events = collect_until(&mut rx, is_terminal).await;

    assert!(events.iter().any(|n| matches!(
        n,
        Notification::PageFailed {
            error: PageError::StoreFailed { page: 2, .. }
        }
    )));
    assert_eq!(events.last(), Some(&Notification::Completed { pages: 2 }));
    assert_eq!(store.inner.len(), 2);

    let summary = orch.request_merge(None).await.unwrap();
    assert_eq!(summary.page_count, 2);
}

#[tokio::test]
async fn an_unparseable_page_is_left_out_of_the_merge() {
    let store = Arc::new(MemoryPageStore::new());
    store.put(1, &pdf_with_pages("a", 1)).await.unwrap();
    store.put(2, b"%PDF-1.4 this is not a document").await.unwrap();
    store.put(3, &pdf_with_pages("c", 2)).await.unwrap();

    let sink = Arc::new(MemorySink::new());
    let orch = orchestrator(
        store,
        Arc::new(ScriptedSource::default()),
        sink.clone(),
        fast_config(),
    );

    let summary = orch.request_merge(Some("Partial")).await.unwrap();
    assert_eq!(summary.page_count, 3);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].page(), 2);
    assert_eq!(page_count(&sink.delivered()[0].bytes), 3);
}

#[tokio::test]
async fn transient_capture_failures_are_retried() {
    let store = Arc::new(MemoryPageStore::new());
    let source = Arc::new(
        ScriptedSource::new(vec![pdf_with_pages("a", 1), pdf_with_pages("b", 1)]).failing(2, 2),
    );
    let orch = orchestrator(
        store.clone(),
        source.clone(),
        Arc::new(MemorySink::new()),
        fast_config(),
    );
    let mut rx = orch.subscribe();

    orch.start("doc").await.unwrap();
    let events = collect_until(&mut rx, is_terminal).await;

    assert_eq!(events.last(), Some(&Notification::Completed { pages: 2 }));
    assert_eq!(source.captures.load(Ordering::SeqCst), 4);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn exhausted_capture_retries_halt_the_loop_but_keep_the_run() {
    let store = Arc::new(MemoryPageStore::new());
    let source = Arc::new(
        ScriptedSource::new(vec![pdf_with_pages("a", 1), pdf_with_pages("b", 1)]).failing(2, 10),
    );
    let orch = orchestrator(
        store.clone(),
        source.clone(),
        Arc::new(MemorySink::new()),
        fast_config(),
    );
    let mut rx = orch.subscribe();

    orch.start("doc").await.unwrap();
    let events = collect_until(&mut rx, is_terminal).await;

    assert!(events.iter().any(|n| matches!(
        n,
        Notification::PageFailed {
            error: PageError::CaptureFailed {
                page: 2,
                attempts: 3,
                ..
            }
        }
    )));
    assert!(matches!(events.last(), Some(Notification::Failed { .. })));
    assert_eq!(source.captures.load(Ordering::SeqCst), 4);

    let snap = orch.snapshot();
    assert!(snap.running);
    assert_eq!(snap.pages_stored, 1);

    // Stored pages survive until the caller decides.
    assert_eq!(orch.request_merge(None).await.unwrap().page_count, 1);
    orch.stop().await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn the_page_cap_ends_the_run_early() {
    let store = Arc::new(MemoryPageStore::new());
    let source = Arc::new(ScriptedSource::new(
        (1..=5).map(|i| pdf_with_pages(&i.to_string(), 1)).collect(),
    ));
    let config = PipelineConfig::builder()
        .retry_backoff_ms(1)
        .max_pages(Some(2))
        .build()
        .unwrap();
    let orch = orchestrator(
        store.clone(),
        source.clone(),
        Arc::new(MemorySink::new()),
        config,
    );
    let mut rx = orch.subscribe();

    orch.start("doc").await.unwrap();
    let events = collect_until(&mut rx, is_terminal).await;

    assert_eq!(events.last(), Some(&Notification::Completed { pages: 2 }));
    assert_eq!(source.captures.load(Ordering::SeqCst), 2);
    assert_eq!(store.len(), 2);
}

// ── Host protocol ────────────────────────────────────────────────────────────

#[tokio::test]
async fn host_session_delivers_the_merge_in_band() {
    let store = Arc::new(MemoryPageStore::new());
    let codec = ChunkCodec::default();
    let (sink, downloads) = MessageSink::channel(codec.clone(), 64 * 1024 * 1024);
    let orch = Orchestrator::builder(store)
        .external_feed()
        .sink(Arc::new(sink))
        .build()
        .unwrap();

    let frames = [
        serde_json::json!({"type": "start", "url": "doc-X"}),
        serde_json::json!({"type": "pageCaptured", "index": 1,
                           "data": codec.encode(&pdf_with_pages("a", 2)).unwrap()}),
        serde_json::json!({"type": "pageCaptured", "index": 2,
                           "data": codec.encode(&pdf_with_pages("b", 1)).unwrap()}),
        serde_json::json!({"type": "MERGE_PDF", "bookTitle": "My Book"}),
        serde_json::json!({"type": "stop"}),
    ];
    let input: String = frames.iter().map(|f| format!("{f}\n")).collect();
    let mut output = Vec::new();

    serve(
        &orch,
        Some(downloads),
        tokio::io::BufReader::new(input.as_bytes()),
        &mut output,
    )
        .await
        .unwrap();

    let out: Vec<serde_json::Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    let responses: Vec<&serde_json::Value> =
        out.iter().filter(|v| v.get("success").is_some()).collect();
    assert_eq!(responses.len(), 5);
    assert!(responses.iter().all(|r| r["success"] == true), "{responses:?}");
    assert_eq!(responses[3]["pageCount"], 3);

    let download = out
        .iter()
        .find(|v| v["type"] == "download")
        .expect("download frame");
    let bytes = codec.decode(download["data"].as_str().unwrap()).unwrap();
    assert_eq!(page_count(&bytes), 3);
    assert!(download["fileName"].as_str().unwrap().starts_with("My_Book_"));
}
