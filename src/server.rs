//! Admin and read HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/admin/status` | Every data source with its last finalized run |
//! | `POST` | `/admin/run/{kind}` | Manual trigger; `202` with the run id |
//! | `GET`  | `/admin/runs/{kind}` | Run history, newest first (`?limit=`) |
//! | `POST` | `/datasources` | Register a data source |
//! | `GET`  | `/records/{variant}` | Canonical records (`?q=&source_kind=&skip=&limit=`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "manual run requested too soon; retry in 95s" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `busy` (409),
//! `conflict` (409), `rate_limited` (429, with `Retry-After`),
//! `unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser dashboards
//! can call the API directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::clock::SystemClock;
use crate::config::Config;
use crate::coordinator::RunCoordinator;
use crate::db;
use crate::error::IngestError;
use crate::hooks::{ChannelHook, HookSink, LogSink, WebhookSink};
use crate::migrate;
use crate::models::{
    DataSource, RecordQuery, RecordVariant, RunRecord, RunStatus, RunTrigger, SourceKind,
    StoredRecord,
};
use crate::service::Service;
use crate::sources::{self, SourceRequest};
use crate::store::SqliteStore;
use crate::worker::RunQueue;

/// How long a manual trigger waits for room in the run queue.
const SUBMIT_WAIT: Duration = Duration::from_secs(5);
const MAX_PAGE: i64 = 200;

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<RunCoordinator>,
    queue: RunQueue,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(coordinator: Arc<RunCoordinator>, queue: RunQueue, config: Arc<Config>) -> Self {
        Self {
            coordinator,
            queue,
            config,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/admin/status", get(handle_status))
        .route("/admin/run/{kind}", post(handle_run))
        .route("/admin/runs/{kind}", get(handle_runs))
        .route("/datasources", post(handle_create_source))
        .route("/records/{variant}", get(handle_records))
        .layer(cors)
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Starts the engine and the HTTP server; runs until Ctrl-C.
///
/// Binds to `[server].bind`, seeds `[[sources]]`, then drives the scheduler
/// and worker pool. On shutdown the server stops accepting requests first,
/// then in-flight runs finish and pending hook events drain.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));

    let seeded = sources::ensure_seeded(store.as_ref(), config, Utc::now()).await?;
    if seeded > 0 {
        info!(count = seeded, "seeded data sources from config");
    }

    let sink: Arc<dyn HookSink> = match &config.hook.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(
            crate::fetch::FetchExecutor::build_client(&config.http)?,
            url.clone(),
        )),
        None => Arc::new(LogSink),
    };
    let (hook, hook_task) = ChannelHook::spawn(sink, config.hook.queue_capacity);

    let service = Service::start(config, store, Arc::new(hook), Arc::new(SystemClock))?;
    let state = AppState::new(
        service.coordinator().clone(),
        service.queue().clone(),
        Arc::new(config.clone()),
    );

    let listener = TcpListener::bind(&config.server.bind).await?;
    println!("threatfeed listening on http://{}", config.server.bind);

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;

    service.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(10), hook_task)
        .await
        .is_err()
    {
        warn!("hook queue did not drain before shutdown");
    }
    pool.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<Duration>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(wait) = self.retry_after {
            // Round up so clients never retry before the gate opens.
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let message = err.to_string();
        match err {
            IngestError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, "not_found", message),
            IngestError::Invalid(_) => bad_request(message),
            IngestError::Conflict(_) => AppError::new(StatusCode::CONFLICT, "conflict", message),
            IngestError::LockBusy { .. } => AppError::new(StatusCode::CONFLICT, "busy", message),
            IngestError::RateLimitExceeded { retry_after } => AppError {
                retry_after: Some(retry_after),
                ..AppError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
            },
            _ => {
                warn!(error = %message, "request failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

fn parse_kind(raw: &str) -> Result<SourceKind, AppError> {
    raw.parse::<SourceKind>().map_err(bad_request)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /admin/status ============

#[derive(Serialize)]
struct SourceStatus {
    id: String,
    kind: SourceKind,
    label: String,
    enabled: bool,
    interval_minutes: i64,
    last_run_at: Option<DateTime<Utc>>,
    last_status: Option<RunStatus>,
    next_run_at: Option<DateTime<Utc>>,
    /// A run is executing right now.
    running: bool,
    last_run: Option<RunRecord>,
}

#[derive(Serialize)]
struct StatusResponse {
    org_id: String,
    sources: Vec<SourceStatus>,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let store = state.coordinator.store();
    let org_id = state.config.ingest.org_id.clone();
    let mut sources = Vec::new();
    for source in store.list_sources(&org_id).await? {
        let running = store
            .latest_run(&source.id)
            .await?
            .is_some_and(|r| r.status == RunStatus::Running);
        let last_run = store.last_finished_run(&source.id).await?;
        sources.push(SourceStatus {
            next_run_at: source.enabled.then(|| source.next_run_at()).flatten(),
            id: source.id,
            kind: source.kind,
            label: source.label,
            enabled: source.enabled,
            interval_minutes: source.interval_minutes,
            last_run_at: source.last_run_at,
            last_status: source.last_status,
            running,
            last_run,
        });
    }
    Ok(Json(StatusResponse { org_id, sources }))
}

// ============ POST /admin/run/{kind} ============

#[derive(Serialize)]
struct RunAccepted {
    run_id: String,
    data_source_id: String,
    kind: SourceKind,
    status: RunStatus,
}

async fn handle_run(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<(StatusCode, Json<RunAccepted>), AppError> {
    let kind = parse_kind(&kind)?;
    let admission = state.coordinator.admit(kind, RunTrigger::Manual).await?;
    let accepted = RunAccepted {
        run_id: admission.run.id.clone(),
        data_source_id: admission.source.id.clone(),
        kind,
        status: admission.run.status,
    };

    if !state
        .queue
        .submit_admitted(admission.clone(), SUBMIT_WAIT)
        .await
    {
        state.coordinator.abort(&admission, "run queue unavailable").await?;
        return Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "run queue is full; try again shortly",
        ));
    }
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

// ============ GET /admin/runs/{kind} ============

#[derive(Deserialize)]
struct RunsParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct RunsResponse {
    kind: SourceKind,
    runs: Vec<RunRecord>,
}

async fn handle_runs(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<RunsParams>,
) -> Result<Json<RunsResponse>, AppError> {
    let kind = parse_kind(&kind)?;
    let limit = params.limit.unwrap_or(20).clamp(1, MAX_PAGE);
    let source = state.coordinator.source_for_kind(kind).await?;
    let runs = state
        .coordinator
        .store()
        .list_runs(&source.id, limit)
        .await?;
    Ok(Json(RunsResponse { kind, runs }))
}

// ============ POST /datasources ============

#[derive(Deserialize)]
struct CreateSourceBody {
    kind: String,
    label: String,
    #[serde(default)]
    config: serde_json::Value,
    interval_minutes: Option<i64>,
    enabled: Option<bool>,
}

async fn handle_create_source(
    State(state): State<AppState>,
    Json(body): Json<CreateSourceBody>,
) -> Result<(StatusCode, Json<DataSource>), AppError> {
    let request = SourceRequest {
        kind: parse_kind(&body.kind)?,
        label: body.label,
        config: body.config,
        interval_minutes: body.interval_minutes,
        enabled: body.enabled.unwrap_or(true),
    };
    let source = sources::register_source(
        state.coordinator.store().as_ref(),
        &state.config,
        request,
        state.coordinator.now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(source)))
}

// ============ GET /records/{variant} ============

#[derive(Deserialize)]
struct RecordsParams {
    q: Option<String>,
    source_kind: Option<String>,
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct RecordsResponse {
    variant: RecordVariant,
    skip: i64,
    limit: i64,
    records: Vec<StoredRecord>,
}

async fn handle_records(
    State(state): State<AppState>,
    Path(variant): Path<String>,
    Query(params): Query<RecordsParams>,
) -> Result<Json<RecordsResponse>, AppError> {
    let variant = variant.parse::<RecordVariant>().map_err(bad_request)?;
    let source_kind = params.source_kind.as_deref().map(parse_kind).transpose()?;
    let skip = params.skip.unwrap_or(0);
    if skip < 0 {
        return Err(bad_request("skip must be >= 0"));
    }
    let limit = params.limit.unwrap_or(50).clamp(1, MAX_PAGE);
    let query = RecordQuery {
        text: params.q.filter(|q| !q.trim().is_empty()),
        source_kind,
        skip,
        limit,
    };
    let records = state
        .coordinator
        .store()
        .list_records(&state.config.ingest.org_id, variant, &query)
        .await?;
    Ok(Json(RecordsResponse {
        variant,
        skip,
        limit,
        records,
    }))
}
