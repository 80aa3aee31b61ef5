//! JSON API over the reconciliation service.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bcr_core::{
    ComparisonRun, ImportStatus, MissingUserRecord, ProgressSnapshot, RunResults, RunStatus,
};
use bcr_storage::{MissingUserFilter, Page, DEFAULT_PER_PAGE};
use bcr_sync::{AppConfig, BulkSummary, ImportMode, ProvisionError, ReconciliationService};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_RUN_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReconciliationService>,
}

impl AppState {
    pub fn new(service: Arc<ReconciliationService>) -> Self {
        Self { service }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        error!(error = %message, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let status = match &err {
            ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
            ProvisionError::FoundInOtherSource(_) | ProvisionError::InProgress(_) => StatusCode::CONFLICT,
            ProvisionError::Remote { .. } => StatusCode::BAD_GATEWAY,
            ProvisionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct SubmitRunBody {
    csv_path: PathBuf,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Default, Deserialize)]
struct MissingUsersQuery {
    status: Option<String>,
    search: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ImportQuery {
    mode: Option<ImportMode>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", get(list_runs_handler).post(submit_run_handler))
        .route("/runs/{id}", get(get_run_handler))
        .route("/runs/{id}/process", post(process_run_handler))
        .route("/runs/{id}/progress", get(progress_handler))
        .route("/runs/{id}/results", get(results_handler))
        .route("/runs/{id}/missing-users", get(missing_users_handler))
        .route("/runs/{id}/import-pending", post(import_pending_handler))
        .route("/runs/{id}/delete-imported", post(delete_imported_handler))
        .route("/missing-users/{id}/import", post(import_user_handler))
        .with_state(state)
}

pub async fn serve(service: Arc<ReconciliationService>, port: u16) -> anyhow::Result<()> {
    let scheduler = service.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %service.config().worker_cron, "worker scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for ctrl-c");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let port = config.web_port;
    let service = ReconciliationService::connect(config).await?;
    serve(Arc::new(service), port).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn find_run(state: &AppState, id: Uuid) -> ApiResult<ComparisonRun> {
    state
        .service
        .get_run(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {id} not found")))
}

async fn list_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<ComparisonRun>>> {
    let status = query
        .status
        .as_deref()
        .map(RunStatus::from_str)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let runs = state
        .service
        .list_runs(status, query.limit.unwrap_or(DEFAULT_RUN_LIMIT))
        .await?;
    Ok(Json(runs))
}

async fn submit_run_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitRunBody>,
) -> ApiResult<(StatusCode, Json<ComparisonRun>)> {
    if !body.csv_path.is_file() {
        return Err(ApiError::bad_request(format!(
            "{} is not a readable file",
            body.csv_path.display()
        )));
    }
    let run = state
        .service
        .submit_run(&body.csv_path, body.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ComparisonRun>> {
    Ok(Json(find_run(&state, id).await?))
}

/// Starts processing in the background and answers 202, or processes inline with `?wait=true`.
async fn process_run_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ProcessQuery>,
) -> ApiResult<Response> {
    let run = find_run(&state, id).await?;
    if run.status != RunStatus::Pending {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("run {id} is {}", run.status.as_str()),
        ));
    }

    if query.wait {
        let run = state.service.process_run(id).await?;
        return Ok(Json(run).into_response());
    }

    let service = state.service.clone();
    tokio::spawn(async move {
        if let Err(err) = service.process_run(id).await {
            warn!(run_id = %id, error = %format!("{err:#}"), "background processing failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": id, "status": "accepted" })),
    )
        .into_response())
}

async fn progress_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProgressSnapshot>> {
    state
        .service
        .get_progress(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run {id} not found")))
}

async fn results_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunResults>> {
    find_run(&state, id).await?;
    state
        .service
        .load_results(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run {id} has no results yet")))
}

async fn missing_users_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MissingUsersQuery>,
) -> ApiResult<Json<Page<MissingUserRecord>>> {
    find_run(&state, id).await?;
    let status = query
        .status
        .as_deref()
        .map(ImportStatus::from_str)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let filter = MissingUserFilter {
        status,
        search: query.search,
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(DEFAULT_PER_PAGE),
    };
    Ok(Json(state.service.list_missing_users(id, &filter).await?))
}

async fn import_user_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ImportQuery>,
) -> ApiResult<Json<MissingUserRecord>> {
    let mode = query.mode.unwrap_or_default();
    Ok(Json(state.service.import_user(id, mode).await?))
}

async fn import_pending_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ImportQuery>,
) -> ApiResult<Json<BulkSummary>> {
    find_run(&state, id).await?;
    let mode = query.mode.unwrap_or_default();
    Ok(Json(state.service.import_all_pending(id, mode).await?))
}

async fn delete_imported_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BulkSummary>> {
    find_run(&state, id).await?;
    Ok(Json(state.service.delete_imported_users(id).await?))
}
