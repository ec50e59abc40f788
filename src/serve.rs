//! Purpose: Provide the HTTP/JSON conversion server for levelhost.
//! Exports: `ServeConfig`, `serve`, `router`.
//! Role: Axum transport over `LevelManager`; owns no lifecycle logic of its own.
//! Invariants: Bad input answers 4xx, failures during a running copy answer 5xx.
//! Invariants: Concurrent conversions are bounded; a slot is held until its job is terminal.
//! Notes: Shutdown cancels live jobs and unloads idle levels before returning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use levelhost::api::{
    DirStore, Error, ErrorKind, FormatRegistry, JobId, LevelManager, Platform,
};

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub max_concurrent_jobs: usize,
}

#[derive(Clone)]
pub struct AppState {
    manager: LevelManager,
    job_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(manager: LevelManager, max_concurrent_jobs: usize) -> Self {
        Self {
            manager,
            job_slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
        }
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let manager = LevelManager::new(Arc::new(DirStore), FormatRegistry::with_builtin());
    let state = Arc::new(AppState::new(manager.clone(), config.max_concurrent_jobs));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(bind = %config.bind, version = APP_VERSION, "serving level conversions");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            manager.shutdown().await;
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })
        }
        _ = shutdown_signal() => {
            info!("shutting down");
            let _ = shutdown_tx.send(());
            // In-flight conversions are waiting on jobs; cancel them so the drain can finish.
            manager.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/info", get(server_info))
        .route("/convert", post(convert))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", delete(cancel_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if config.max_concurrent_jobs == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-concurrent-jobs must be greater than zero")
            .with_hint("Use a positive value like 4."));
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertQuery {
    source: Option<String>,
    target: Option<String>,
    target_format: Option<String>,
    target_platform: Option<String>,
    target_version: Option<String>,
}

#[derive(Debug)]
struct ConvertRequest {
    source: PathBuf,
    target: PathBuf,
    target_format: String,
    target_platform: Platform,
}

impl ConvertRequest {
    fn from_query(query: ConvertQuery) -> Result<Self, Error> {
        let source = required(query.source, "source")?;
        let target = required(query.target, "target")?;
        let target_format = required(query.target_format, "targetFormat")?;
        let platform_name = required(query.target_platform, "targetPlatform")?;
        let version_text = required(query.target_version, "targetVersion")?;
        let version = Platform::parse_version(&version_text).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid targetVersion parameter: {version_text}"))
        })?;
        Ok(Self {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            target_format,
            target_platform: Platform::new(platform_name, version),
        })
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, Error> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::new(ErrorKind::Usage).with_message(format!("no specified {name} parameter"))),
    }
}

#[derive(Debug, Serialize)]
struct FailureBody {
    result: bool,
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    error: String,
}

async fn root() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/info")]).into_response()
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn server_info(State(state): State<Arc<AppState>>) -> Response {
    let jobs = state.manager.list_live_jobs();
    let levels = state.manager.list_open_levels();
    json_response(json!({
        "appVersion": APP_VERSION,
        "runningProcessCount": jobs.len(),
        "runningProcesses": jobs,
        "openFileCount": levels.len(),
        "openFiles": levels,
        "formats": state.manager.formats().names(),
    }))
}

async fn convert(State(state): State<Arc<AppState>>, Query(query): Query<ConvertQuery>) -> Response {
    let request = match ConvertRequest::from_query(query) {
        Ok(request) => request,
        Err(err) => return failure_response(StatusCode::BAD_REQUEST, "invalid request", &err),
    };
    let permit = match Arc::clone(&state.job_slots).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            let err = Error::new(ErrorKind::Busy)
                .with_message("too many concurrent conversions")
                .with_hint("Try again later or raise --max-concurrent-jobs.");
            return failure_response(StatusCode::TOO_MANY_REQUESTS, "busy", &err);
        }
    };

    if !request.source.exists() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message(format!("Not exists path: {}", request.source.display()))
            .with_path(&request.source);
        return failure_response(StatusCode::FORBIDDEN, "invalid source file", &err);
    }
    let lease = match state.manager.pin(&request.source).await {
        Ok(lease) => lease,
        Err(err) => return failure_response(StatusCode::FORBIDDEN, "invalid source file", &err),
    };

    let target = match state
        .manager
        .resolve_target_writer(&request.target, &request.target_format)
    {
        Ok(target) => target.with_platform(request.target_platform),
        Err(err) => {
            lease.release().await;
            return failure_response(StatusCode::FORBIDDEN, "invalid target file", &err);
        }
    };

    let job = match state.manager.start_copy_job(lease.handle(), target) {
        Ok(job) => job,
        Err(err) => {
            lease.release().await;
            return process_failure(&err);
        }
    };
    // The job holds its own use of the source from here on.
    lease.release().await;

    let slot_job = Arc::clone(&job);
    tokio::spawn(async move {
        let _ = slot_job.wait().await;
        drop(permit);
    });

    match job.wait().await {
        Ok(()) => json_response(json!({ "result": true, "job": job.id() })),
        Err(err) => process_failure(&err),
    }
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Response {
    json_response(json!({ "jobs": state.manager.list_live_jobs() }))
}

async fn cancel_job(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<u64>) -> Response {
    let Some(job) = state.manager.job(JobId::from_raw(id)) else {
        let err = Error::new(ErrorKind::NotFound).with_message(format!("no live job {id}"));
        return failure_response(StatusCode::NOT_FOUND, "unknown job", &err);
    };
    match job.cancel().await {
        Ok(()) => json_response(json!({ "result": true, "status": job.status() })),
        Err(err) => process_failure(&err),
    }
}

fn process_failure(err: &Error) -> Response {
    match err.kind() {
        ErrorKind::Cancelled => failure_response(StatusCode::CONFLICT, "process cancelled", err),
        ErrorKind::AlreadyExists | ErrorKind::UnknownFormat => {
            failure_response(StatusCode::FORBIDDEN, "invalid target file", err)
        }
        ErrorKind::Closed => failure_response(StatusCode::CONFLICT, "source unloaded", err),
        _ => failure_response(StatusCode::INTERNAL_SERVER_ERROR, "process error", err),
    }
}

fn failure_response(status: StatusCode, kind: &'static str, err: &Error) -> Response {
    let body = FailureBody {
        result: false,
        kind,
        message: err
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        error: format!("{:?}", err.kind()),
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("levelhost-version", HeaderValue::from_static(APP_VERSION));
    response
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("levelhost-version", HeaderValue::from_static(APP_VERSION));
    response
}
