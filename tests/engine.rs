//! Engine-level integration tests.
//!
//! Each test runs the real coordinator against a local axum server standing
//! in for the upstream feed, with either a tempfile SQLite database or the
//! in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use threatfeed::clock::{Clock, ManualClock, SystemClock};
use threatfeed::config::Config;
use threatfeed::coordinator::RunCoordinator;
use threatfeed::cursor::Cursor;
use threatfeed::db;
use threatfeed::error::IngestError;
use threatfeed::hooks::{ChangeKind, RecordEvent, RecordHook};
use threatfeed::migrate;
use threatfeed::models::{
    RecordQuery, RecordVariant, RunStatus, RunTrigger, SourceKind,
};
use threatfeed::scheduler::Scheduler;
use threatfeed::sources::{register_source, SourceRequest};
use threatfeed::store::{MemoryStore, SqliteStore, Store, ABANDONED};
use threatfeed::worker::{RunQueue, SubmitOutcome, WorkerPool};

// ─── Upstream stand-in ──────────────────────────────────────────────

#[derive(Clone)]
struct Upstream {
    feed: Arc<Mutex<String>>,
    json: Arc<Mutex<Value>>,
    status: Arc<Mutex<u16>>,
    hits: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Upstream {
    fn new() -> Self {
        Self {
            feed: Arc::new(Mutex::new(String::new())),
            json: Arc::new(Mutex::new(json!({}))),
            status: Arc::new(Mutex::new(200)),
            hits: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn set_feed(&self, body: String) {
        *self.feed.lock().unwrap() = body;
    }

    fn set_json(&self, body: Value) {
        *self.json.lock().unwrap() = body;
    }

    fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Option<Response> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock().unwrap();
        (status != 200).then(|| StatusCode::from_u16(status).unwrap().into_response())
    }
}

async fn serve_feed(State(up): State<Upstream>) -> Response {
    if let Some(resp) = up.failure() {
        return resp;
    }
    let body = up.feed.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "application/rss+xml")], body).into_response()
}

async fn serve_json(State(up): State<Upstream>) -> Response {
    if let Some(resp) = up.failure() {
        return resp;
    }
    let body = up.json.lock().unwrap().clone();
    axum::Json(body).into_response()
}

/// Holds each request open briefly and records peak concurrency.
async fn serve_held(State(up): State<Upstream>) -> Response {
    let now = up.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    up.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    up.in_flight.fetch_sub(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "application/rss+xml")], rss(&["held"])).into_response()
}

async fn serve_slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(10)).await;
    "<rss></rss>"
}

async fn start_upstream(up: Upstream) -> String {
    let app = Router::new()
        .route("/feed.xml", get(serve_feed))
        .route("/catalog.json", get(serve_json))
        .route("/nvd", get(serve_json))
        .route("/slow.xml", get(serve_slow))
        .route("/held.xml", get(serve_held))
        .with_state(up);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn rss(guids: &[&str]) -> String {
    let items: String = guids
        .iter()
        .map(|g| {
            format!(
                "<item><guid>{g}</guid><title>Advisory {g}</title>\
                 <link>https://advisories.example.com/{g}</link>\
                 <pubDate>Mon, 03 Jun 2024 10:00:00 GMT</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Advisories</title>{items}</channel></rss>"#
    )
}

fn nvd_item(id: &str) -> Value {
    json!({"cve": {
        "id": id,
        "published": "2024-06-01T10:00:00.000",
        "lastModified": "2024-06-02T10:00:00.000",
        "descriptions": [{"lang": "en", "value": format!("{id} description")}],
        "references": [{"url": format!("https://nvd.example.com/{id}")}]
    }})
}

fn kev_catalog(entries: &[(&str, &str)]) -> Value {
    let vulns: Vec<Value> = entries
        .iter()
        .map(|(id, added)| json!({"cveID": id, "vendorProject": "Acme", "dateAdded": added}))
        .collect();
    json!({ "vulnerabilities": vulns })
}

// ─── Harness ────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder(Mutex<Vec<RecordEvent>>);

impl Recorder {
    fn take(&self) -> Vec<RecordEvent> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl RecordHook for Recorder {
    fn publish(&self, event: RecordEvent) {
        self.0.lock().unwrap().push(event);
    }
}

struct PanickingHook;

impl RecordHook for PanickingHook {
    fn publish(&self, _event: RecordEvent) {
        panic!("downstream hook exploded");
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut cfg = Config::with_db_path(tmp.path().join("threatfeed.sqlite"));
    cfg.http.max_attempts = 2;
    cfg.http.initial_backoff_ms = 1;
    cfg.http.jitter = 0.0;
    cfg.http.timeout_secs = 5;
    cfg
}

async fn sqlite_store(cfg: &Config) -> Arc<dyn Store> {
    let pool = db::connect(cfg).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

async fn add_source(store: &dyn Store, cfg: &Config, kind: SourceKind, config: Value) {
    register_source(
        store,
        cfg,
        SourceRequest {
            kind,
            label: kind.to_string(),
            config,
            interval_minutes: Some(60),
            enabled: true,
        },
        Utc::now(),
    )
    .await
    .unwrap();
}

async fn committed_cursor(store: &dyn Store, cfg: &Config, kind: SourceKind) -> Cursor {
    let source = store
        .find_source(&cfg.ingest.org_id, kind)
        .await
        .unwrap()
        .unwrap();
    Cursor::decode(source.last_success_cursor.as_deref()).unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

/// First run inserts {a,b,c}; second run sees {b,c,d} and only `d` is new.
#[tokio::test]
async fn test_rss_end_to_end_delta() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::Rss,
        json!({ "feed_url": format!("{base}/feed.xml") }),
    )
    .await;

    let hook = Arc::new(Recorder::default());
    let coordinator =
        RunCoordinator::new(&cfg, store.clone(), hook.clone(), Arc::new(SystemClock)).unwrap();

    up.set_feed(rss(&["a", "b", "c"]));
    let first = coordinator
        .run_now(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.counts.inserted, 3);
    assert_eq!(hook.take().len(), 3);

    let cursor = committed_cursor(store.as_ref(), &cfg, SourceKind::Rss).await;
    for g in ["a", "b", "c"] {
        assert!(cursor.has_seen(g), "seen-set should contain {g}");
    }

    up.set_feed(rss(&["b", "c", "d"]));
    let second = coordinator
        .run_now(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.counts.inserted, 1);
    assert_eq!(second.counts.unchanged, 2);
    assert_eq!(second.counts.changed, 0);

    let events = hook.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].natural_key, "d");
    assert_eq!(events[0].change, ChangeKind::New);

    let records = store
        .list_records(
            &cfg.ingest.org_id,
            RecordVariant::Advisory,
            &RecordQuery {
                limit: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 4);
    assert!(committed_cursor(store.as_ref(), &cfg, SourceKind::Rss)
        .await
        .has_seen("d"));
}

/// Ten NVD items, the seventh malformed: nine upserts, one parse error, PARTIAL.
#[tokio::test]
async fn test_malformed_item_is_contained() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::Nvd,
        json!({ "base_url": format!("{base}/nvd"), "api_key": "test-key" }),
    )
    .await;

    let mut vulns: Vec<Value> = (1..=10)
        .map(|i| nvd_item(&format!("CVE-2024-{:04}", 1000 + i)))
        .collect();
    vulns[6] = json!({"cve": {"id": "not-a-cve"}});
    up.set_json(json!({
        "resultsPerPage": 10,
        "startIndex": 0,
        "totalResults": 10,
        "vulnerabilities": vulns
    }));

    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        Arc::new(SystemClock),
    )
    .unwrap();
    let run = coordinator
        .run_now(SourceKind::Nvd, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.counts.fetched, 10);
    assert_eq!(run.counts.normalized, 9);
    assert_eq!(run.counts.parse_errors, 1);
    assert_eq!(run.counts.upserted(), 9);
    assert_eq!(run.status, RunStatus::Partial);

    let records = store
        .list_records(
            &cfg.ingest.org_id,
            RecordVariant::Cve,
            &RecordQuery {
                limit: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 9);
}

/// Concurrent manual triggers: exactly one is admitted.
#[tokio::test]
async fn test_single_flight_under_concurrency() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    add_source(store.as_ref(), &cfg, SourceKind::CisaKev, json!({})).await;

    let coordinator = Arc::new(
        RunCoordinator::new(
            &cfg,
            store.clone(),
            Arc::new(Recorder::default()),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let c = coordinator.clone();
            tokio::spawn(async move { c.admit(SourceKind::CisaKev, RunTrigger::Manual).await })
        })
        .collect();

    let mut admitted = 0;
    let mut busy = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(IngestError::LockBusy { .. }) => busy += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(busy, 7);

    let source = coordinator.source_for_kind(SourceKind::CisaKev).await.unwrap();
    let runs = store.list_runs(&source.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);
}

/// A manual trigger inside the cooldown is rejected; after it, accepted.
#[tokio::test]
async fn test_manual_cooldown() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    up.set_json(kev_catalog(&[("CVE-2024-0001", "2024-05-01")]));
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::CisaKev,
        json!({ "url": format!("{base}/catalog.json") }),
    )
    .await;

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        clock.clone(),
    )
    .unwrap();

    let first = coordinator
        .run_now(SourceKind::CisaKev, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Success);

    clock.advance(chrono::Duration::seconds(30));
    match coordinator.admit(SourceKind::CisaKev, RunTrigger::Manual).await {
        Err(IngestError::RateLimitExceeded { retry_after }) => {
            assert_eq!(retry_after, Duration::from_secs(90));
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }

    // Scheduled runs are exempt from the cooldown.
    let scheduled = coordinator
        .run_now(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(scheduled.status, RunStatus::Success);

    clock.advance(chrono::Duration::seconds(121));
    let again = coordinator
        .run_now(SourceKind::CisaKev, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(again.status, RunStatus::Success);
}

/// The cursor holds on a failed persist and never moves backwards.
#[tokio::test]
async fn test_cursor_monotonic_and_held_on_persist_failure() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::CisaKev,
        json!({ "url": format!("{base}/catalog.json") }),
    )
    .await;
    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        Arc::new(SystemClock),
    )
    .unwrap();
    let may_3 = Cursor::Timestamp {
        at: Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap(),
    };

    up.set_json(kev_catalog(&[
        ("CVE-2024-0001", "2024-05-01"),
        ("CVE-2024-0002", "2024-05-03"),
    ]));
    let run = coordinator
        .run_now(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(committed_cursor(store.as_ref(), &cfg, SourceKind::CisaKev).await, may_3);

    // Newer entry, but the batch cannot be written.
    up.set_json(kev_catalog(&[
        ("CVE-2024-0002", "2024-05-03"),
        ("CVE-2024-0003", "2024-05-10"),
    ]));
    store.fail_next_upserts(1, false);
    let failed = coordinator
        .run_now(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error.is_some());
    assert_eq!(committed_cursor(store.as_ref(), &cfg, SourceKind::CisaKev).await, may_3);

    // Upstream now reports only older entries; the cursor must not regress.
    up.set_json(kev_catalog(&[("CVE-2024-0001", "2024-05-01")]));
    let run = coordinator
        .run_now(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.fetched, 0);
    assert_eq!(committed_cursor(store.as_ref(), &cfg, SourceKind::CisaKev).await, may_3);
}

/// 5xx is retried up to the attempt cap; 4xx is not retried at all.
#[tokio::test]
async fn test_fetch_failures_fail_the_run() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::Rss,
        json!({ "feed_url": format!("{base}/feed.xml") }),
    )
    .await;
    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        Arc::new(SystemClock),
    )
    .unwrap();

    up.set_status(503);
    let run = coordinator
        .run_now(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counts.pages_failed, 1);
    assert_eq!(up.hits(), 2);

    up.set_status(404);
    let run = coordinator
        .run_now(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(up.hits(), 3);

    let source = coordinator.source_for_kind(SourceKind::Rss).await.unwrap();
    assert_eq!(source.last_status, Some(RunStatus::Failed));
    assert!(source.last_success_cursor.is_none());
}

/// One dead feed does not stop the others; the run is PARTIAL and the
/// seen-set is not committed.
#[tokio::test]
async fn test_failed_feed_is_contained_to_its_chain() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    up.set_feed(rss(&["a", "b"]));
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::Rss,
        json!({ "feeds": [
            format!("{base}/feed.xml"),
            { "url": format!("{base}/missing.xml"), "label": "gone" }
        ]}),
    )
    .await;
    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        Arc::new(SystemClock),
    )
    .unwrap();

    let run = coordinator
        .run_now(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counts.inserted, 2);
    assert_eq!(run.counts.pages_ok, 1);
    assert_eq!(run.counts.pages_failed, 1);
    assert!(committed_cursor(store.as_ref(), &cfg, SourceKind::Rss)
        .await
        .is_empty());
}

/// The run-level deadline abandons outstanding pages.
#[tokio::test]
async fn test_run_timeout_finalizes_run() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.ingest.run_timeout_secs = 1;
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::Rss,
        json!({ "feed_url": format!("{base}/slow.xml") }),
    )
    .await;
    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        Arc::new(SystemClock),
    )
    .unwrap();

    let run = coordinator
        .run_now(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("timed out"));

    // The lock is released: a new run can be admitted.
    coordinator
        .admit(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
}

/// A run stuck in RUNNING past the stale threshold is reaped by the next
/// tick and its source re-enqueued.
#[tokio::test]
async fn test_scheduler_reaps_abandoned_runs() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    add_source(store.as_ref(), &cfg, SourceKind::CisaKev, json!({})).await;

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let coordinator = Arc::new(
        RunCoordinator::new(
            &cfg,
            store.clone(),
            Arc::new(Recorder::default()),
            clock.clone(),
        )
        .unwrap(),
    );
    let stuck = coordinator
        .admit(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();

    let (queue, mut rx) = RunQueue::channel(8);
    let scheduler = Scheduler::new(coordinator.clone(), queue, Duration::from_secs(60));

    // Not stale yet, not due yet.
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.reaped, 0);
    assert_eq!(report.enqueued, 0);

    clock.advance(chrono::Duration::seconds(cfg.ingest.stale_run_secs as i64 + 1));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.enqueued, 1);
    assert_eq!(rx.try_recv().unwrap().source_id(), stuck.source.id);

    let last = store
        .last_finished_run(&stuck.source.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.id, stuck.run.id);
    assert_eq!(last.status, RunStatus::Failed);
    assert_eq!(last.error.as_deref(), Some(ABANDONED));
}

/// Due sources are enqueued once; disabled sources never.
#[tokio::test]
async fn test_scheduler_enqueues_due_sources_once() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    add_source(store.as_ref(), &cfg, SourceKind::CisaKev, json!({})).await;
    register_source(
        store.as_ref(),
        &cfg,
        SourceRequest {
            kind: SourceKind::Msrc,
            label: "MSRC".into(),
            config: json!({}),
            interval_minutes: None,
            enabled: false,
        },
        Utc::now(),
    )
    .await
    .unwrap();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let coordinator = Arc::new(
        RunCoordinator::new(&cfg, store.clone(), Arc::new(Recorder::default()), clock).unwrap(),
    );
    let (queue, _rx) = RunQueue::channel(8);
    let scheduler = Scheduler::new(coordinator, queue.clone(), Duration::from_secs(60));

    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.enqueued, 1);

    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.enqueued, 0);
    assert_eq!(report.already_pending, 1);
    assert_eq!(queue.pending_count(), 1);
}

/// A single worker runs queued sources one after another.
#[tokio::test]
async fn test_pool_caps_concurrent_runs() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    for kind in [SourceKind::Rss, SourceKind::Msrc] {
        add_source(
            store.as_ref(),
            &cfg,
            kind,
            json!({ "feed_url": format!("{base}/held.xml") }),
        )
        .await;
    }
    let coordinator = Arc::new(
        RunCoordinator::new(
            &cfg,
            store.clone(),
            Arc::new(Recorder::default()),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );

    let (queue, rx) = RunQueue::channel(8);
    let pool = WorkerPool::spawn(coordinator.clone(), &queue, rx, 1);
    let sources = store.list_sources(&cfg.ingest.org_id).await.unwrap();
    for source in &sources {
        assert_eq!(queue.submit_scheduled(&source.id), SubmitOutcome::Queued);
    }
    drop(queue);
    pool.join().await;

    assert_eq!(up.max_in_flight(), 1);
    for source in &sources {
        let run = store.latest_run(&source.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success, "{}", source.kind);
    }
}

/// A run whose task panics is finalized FAILED and releases the source.
#[tokio::test]
async fn test_panicking_run_is_finalized_failed() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::Rss,
        json!({ "feed_url": format!("{base}/feed.xml") }),
    )
    .await;
    up.set_feed(rss(&["a"]));
    let coordinator = Arc::new(
        RunCoordinator::new(&cfg, store.clone(), Arc::new(PanickingHook), Arc::new(SystemClock))
            .unwrap(),
    );

    let (queue, rx) = RunQueue::channel(8);
    let pool = WorkerPool::spawn(coordinator.clone(), &queue, rx, 1);
    let source = coordinator.source_for_kind(SourceKind::Rss).await.unwrap();
    assert_eq!(queue.submit_scheduled(&source.id), SubmitOutcome::Queued);
    drop(queue);
    pool.join().await;

    let run = store.latest_run(&source.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().starts_with("run task aborted"));
    assert!(run.ended_at.is_some());

    // Nothing is left RUNNING, so the source can run again.
    coordinator
        .admit(SourceKind::Rss, RunTrigger::Scheduled)
        .await
        .unwrap();
}

/// A run reaped as abandoned stops before fetching and leaves the newer
/// run alone.
#[tokio::test]
async fn test_reaped_run_stops_executing() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(MemoryStore::new());
    let up = Upstream::new();
    let base = start_upstream(up.clone()).await;
    add_source(
        store.as_ref(),
        &cfg,
        SourceKind::CisaKev,
        json!({ "url": format!("{base}/catalog.json") }),
    )
    .await;
    up.set_json(kev_catalog(&[("CVE-2024-0001", "2024-05-01")]));

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let coordinator = RunCoordinator::new(
        &cfg,
        store.clone(),
        Arc::new(Recorder::default()),
        clock.clone(),
    )
    .unwrap();

    let old = coordinator
        .admit(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(cfg.ingest.stale_run_secs as i64 + 1));
    let fresh = coordinator
        .admit(SourceKind::CisaKev, RunTrigger::Scheduled)
        .await
        .unwrap();

    let err = coordinator.execute(old.clone()).await.unwrap_err();
    assert!(matches!(err, IngestError::Conflict(_)));
    assert_eq!(up.hits(), 0);
    assert_eq!(store.record_count(), 0);

    let latest = store.latest_run(&old.source.id).await.unwrap().unwrap();
    assert_eq!(latest.id, fresh.run.id);
    assert_eq!(latest.status, RunStatus::Running);

    let run = coordinator.execute(fresh).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.inserted, 1);
}
