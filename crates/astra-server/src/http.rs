// HTTP surface of the kernel: REST routes under /api/v1, bearer/loopback
// auth, and the per-run SSE stream with bounded replay.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use astra_core::auth::{bootstrap_token, verify_token, AuthFailure};
use astra_core::config::AuthMode;
use astra_core::{vault, AstraError};
use astra_engine::{build_snapshot, EngineError};
use astra_types::{ApprovalStatus, ConflictStatus, Event, RunMode};

use crate::AppState;

// ============================================================================
// Error envelope
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    fn with_code(status: StatusCode, message: impl Into<String>, code: &str) -> Self {
        Self {
            status,
            message: message.into(),
            code: Some(code.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorEnvelope {
                error: self.message,
                code: self.code,
            }),
        )
            .into_response()
    }
}

impl From<AstraError> for ApiError {
    fn from(error: AstraError) -> Self {
        match &error {
            AstraError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, error.to_string()),
            AstraError::Conflict(_) => ApiError::new(StatusCode::CONFLICT, error.to_string()),
            AstraError::Validation(_) | AstraError::InvalidOperation(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, error.to_string())
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match &error {
            EngineError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, error.to_string()),
            EngineError::Validation(_) | EngineError::InvalidOperation(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, error.to_string())
            }
            EngineError::Store(store_error) => {
                ApiError::from(AstraError::InvalidConfig(store_error.to_string()))
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }
}

// ============================================================================
// Inputs
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProjectCreate {
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    settings: Value,
}

#[derive(Debug, Deserialize)]
struct RunCreate {
    query_text: String,
    mode: String,
    #[serde(default)]
    parent_run_id: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BootstrapRequest {
    token: String,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    once: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct MemoryListQuery {
    query: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct MemoryCreate {
    #[serde(default)]
    title: Option<String>,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnlockPayload {
    passphrase: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiPayload {
    api_key: String,
}

// ============================================================================
// Router & middleware
// ============================================================================

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/auth/status", get(auth_status))
        .route("/api/v1/auth/bootstrap", post(auth_bootstrap))
        .route("/api/v1/projects", post(create_project).get(list_projects))
        .route("/api/v1/projects/{id}/runs", post(create_run))
        .route("/api/v1/runs/{id}/plan", post(create_plan).get(get_plan))
        .route("/api/v1/runs/{id}/start", post(start_run))
        .route("/api/v1/runs/{id}/pause", post(pause_run))
        .route("/api/v1/runs/{id}/resume", post(resume_run))
        .route("/api/v1/runs/{id}/cancel", post(cancel_run))
        .route("/api/v1/runs/{id}/tasks/{task_id}/retry", post(retry_task))
        .route("/api/v1/runs/{id}/steps/{step_id}/retry", post(retry_step))
        .route("/api/v1/runs/{id}", get(get_run))
        .route("/api/v1/runs/{id}/tasks", get(get_tasks))
        .route("/api/v1/runs/{id}/sources", get(get_sources))
        .route("/api/v1/runs/{id}/facts", get(get_facts))
        .route("/api/v1/runs/{id}/conflicts", get(get_conflicts))
        .route("/api/v1/runs/{id}/artifacts", get(get_artifacts))
        .route("/api/v1/runs/{id}/approvals", get(get_approvals))
        .route("/api/v1/runs/{id}/snapshot", get(get_snapshot))
        .route("/api/v1/runs/{id}/snapshot/download", get(download_snapshot))
        .route("/api/v1/runs/{id}/events", get(run_events))
        .route(
            "/api/v1/runs/{id}/conflicts/{conflict_id}/resolve",
            post(resolve_conflict),
        )
        .route("/api/v1/approvals/{id}/approve", post(approve_approval))
        .route("/api/v1/approvals/{id}/reject", post(reject_approval))
        .route("/api/v1/memory/create", post(memory_create))
        .route("/api/v1/memory/list", get(memory_list))
        .route("/api/v1/memory/{id}", delete(memory_delete))
        .route("/api/v1/secrets/unlock", post(secrets_unlock))
        .route("/api/v1/secrets/openai", post(secrets_openai))
        .route("/api/v1/secrets/status", get(secrets_status))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

fn extract_bearer(headers: &HeaderMap) -> (Option<String>, bool) {
    let Some(raw) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return (None, false);
    };
    let trimmed = raw.trim();
    match trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
    {
        Some(token) if !token.trim().is_empty() => (Some(token.trim().to_string()), false),
        _ => (None, true),
    }
}

fn is_loopback(request: &Request) -> Option<bool> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().is_loopback())
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let path = request.uri().path();
    // Auth bootstrap endpoints stay reachable without a token.
    if path == "/api/v1/auth/status" || path == "/api/v1/auth/bootstrap" {
        return next.run(request).await;
    }

    if state.config.auth_mode == AuthMode::Local {
        match is_loopback(&request) {
            // No client address at all (in-process calls) counts as local.
            None => return next.run(request).await,
            Some(true) => return next.run(request).await,
            Some(false) => {}
        }
    }

    let (mut token, bad_scheme) = extract_bearer(request.headers());
    if token.is_none() {
        token = request.uri().query().and_then(|query| {
            query.split('&').find_map(|pair| {
                pair.strip_prefix("token=")
                    .map(str::to_string)
                    .filter(|value| !value.is_empty())
            })
        });
    }

    match verify_token(&state.store, token.as_deref(), bad_scheme).await {
        Ok(()) => next.run(request).await,
        Err(failure) => {
            tracing::warn!(
                "auth_denied reason={} method={} path={}",
                failure.as_str(),
                request.method(),
                path
            );
            let code = match failure {
                AuthFailure::TokenNotInitialized => "token_not_initialized",
                AuthFailure::BadScheme => "bad_scheme",
                AuthFailure::MissingAuthorization => "missing_authorization",
                AuthFailure::InvalidToken => "invalid_token",
            };
            ApiError::with_code(StatusCode::UNAUTHORIZED, code, code).into_response()
        }
    }
}

fn qa_mode_requested(headers: &HeaderMap) -> bool {
    let header = headers
        .get("X-Astra-QA-Mode")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if matches!(header.as_str(), "1" | "true" | "yes" | "on") {
        return true;
    }
    astra_core::config::AppConfig::qa_mode_env()
}

// ============================================================================
// Auth routes
// ============================================================================

async fn auth_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let initialized = state.store.get_session_token_hash().await?.is_some();
    let auth_mode = state.config.auth_mode;
    Ok(Json(json!({
        "initialized": initialized,
        "auth_mode": auth_mode.as_str(),
        "token_required": auth_mode == AuthMode::Strict,
    })))
}

async fn auth_bootstrap(
    State(state): State<AppState>,
    Json(payload): Json<BootstrapRequest>,
) -> Result<Json<Value>, ApiError> {
    let status = bootstrap_token(&state.store, &state.data_dir, &payload.token).await?;
    Ok(Json(json!({ "status": status.as_str() })))
}

// ============================================================================
// Projects & runs
// ============================================================================

async fn create_project(
    State(state): State<AppState>,
    Json(payload): Json<ProjectCreate>,
) -> Result<Json<Value>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "name is required"));
    }
    let project = state
        .store
        .create_project(payload.name.trim(), &payload.tags, &payload.settings)
        .await?;
    Ok(Json(serde_json::to_value(project).map_err(AstraError::from)?))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let projects = state.store.list_projects().await?;
    Ok(Json(serde_json::to_value(projects).map_err(AstraError::from)?))
}

async fn create_run(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<RunCreate>,
) -> Result<Json<Value>, ApiError> {
    let Some(mode) = RunMode::parse(&payload.mode) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Недопустимый режим запуска",
        ));
    };
    if payload.query_text.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "query_text is required"));
    }
    let qa_mode = qa_mode_requested(&headers);
    let outcome = state
        .kernel
        .create_run(
            &project_id,
            &payload.query_text,
            mode,
            payload.parent_run_id.as_deref(),
            payload.purpose.as_deref(),
            qa_mode,
        )
        .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(AstraError::from)?))
}

async fn require_run(state: &AppState, run_id: &str) -> Result<astra_types::Run, ApiError> {
    state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Запуск не найден"))
}

async fn create_plan(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = require_run(&state, &run_id).await?;
    let steps = state.engine.create_plan(&run).await?;
    Ok(Json(serde_json::to_value(steps).map_err(AstraError::from)?))
}

async fn start_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    state.engine.start_run(&run_id).await?;
    Ok(Json(json!({ "status": "запущено" })))
}

async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.engine.pause_run(&run_id).await?;
    Ok(Json(serde_json::to_value(run).map_err(AstraError::from)?))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.engine.resume_run(&run_id).await?;
    Ok(Json(serde_json::to_value(run).map_err(AstraError::from)?))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.engine.cancel_run(&run_id).await?;
    Ok(Json(serde_json::to_value(run).map_err(AstraError::from)?))
}

async fn retry_task(
    State(state): State<AppState>,
    Path((run_id, task_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let task = state.engine.retry_task(&run_id, &task_id).await?;
    Ok(Json(serde_json::to_value(task).map_err(AstraError::from)?))
}

async fn retry_step(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let step = state.engine.retry_step(&run_id, &step_id).await?;
    Ok(Json(serde_json::to_value(step).map_err(AstraError::from)?))
}

// ============================================================================
// Run read model
// ============================================================================

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = require_run(&state, &run_id).await?;
    Ok(Json(serde_json::to_value(run).map_err(AstraError::from)?))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let steps = state.store.list_plan_steps(&run_id).await?;
    Ok(Json(serde_json::to_value(steps).map_err(AstraError::from)?))
}

async fn get_tasks(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let tasks = state.store.list_tasks(&run_id).await?;
    Ok(Json(serde_json::to_value(tasks).map_err(AstraError::from)?))
}

async fn get_sources(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let sources = state.store.list_sources(&run_id).await?;
    Ok(Json(serde_json::to_value(sources).map_err(AstraError::from)?))
}

async fn get_facts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let facts = state.store.list_facts(&run_id).await?;
    Ok(Json(serde_json::to_value(facts).map_err(AstraError::from)?))
}

async fn get_conflicts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let conflicts = state.store.list_conflicts(&run_id).await?;
    Ok(Json(serde_json::to_value(conflicts).map_err(AstraError::from)?))
}

async fn get_artifacts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let artifacts = state.store.list_artifacts(&run_id).await?;
    Ok(Json(serde_json::to_value(artifacts).map_err(AstraError::from)?))
}

async fn get_approvals(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_run(&state, &run_id).await?;
    let approvals = state.store.list_approvals(&run_id).await?;
    Ok(Json(serde_json::to_value(approvals).map_err(AstraError::from)?))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = build_snapshot(&state.store, &run_id).await?;
    Ok(Json(serde_json::to_value(snapshot).map_err(AstraError::from)?))
}

async fn download_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = build_snapshot(&state.store, &run_id).await?;
    let body = serde_json::to_string_pretty(&snapshot).map_err(AstraError::from)?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"run-{}-snapshot.json\"", run_id),
            ),
        ],
        body,
    )
        .into_response())
}

// ============================================================================
// SSE
// ============================================================================

fn sse_event(event: &Event) -> Option<SseEvent> {
    let data = serde_json::to_string(event).ok()?;
    Some(
        SseEvent::default()
            .id(event.id.to_string())
            .event(event.event_type.as_str())
            .data(data),
    )
}

type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>>;

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<axum::response::sse::KeepAliveStream<SseStream>>, ApiError> {
    require_run(&state, &run_id).await?;
    let replay = state.bus.replay(&run_id, 200).await?;
    let last_replayed = replay.last().map(|event| event.id).unwrap_or(0);
    let replay_stream = futures::stream::iter(
        replay
            .iter()
            .filter_map(sse_event)
            .map(Ok::<_, Infallible>)
            .collect::<Vec<_>>(),
    );

    if query.once == Some(1) {
        let stream: SseStream = Box::pin(replay_stream);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))));
    }

    let live = BroadcastStream::new(state.bus.subscribe()).filter_map(move |item| {
        let run_id = run_id.clone();
        async move {
            match item {
                Ok(event) if event.run_id == run_id && event.id > last_replayed => {
                    sse_event(&event).map(Ok)
                }
                _ => None,
            }
        }
    });

    let stream: SseStream = Box::pin(replay_stream.chain(live));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

// ============================================================================
// Approvals & conflicts
// ============================================================================

async fn decide_approval(
    state: &AppState,
    approval_id: &str,
    status: ApprovalStatus,
) -> Result<Json<Value>, ApiError> {
    let approval = state
        .store
        .update_approval_status(approval_id, status, "owner")
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Подтверждение не найдено"))?;
    Ok(Json(serde_json::to_value(approval).map_err(AstraError::from)?))
}

async fn approve_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    decide_approval(&state, &approval_id, ApprovalStatus::Approved).await
}

async fn reject_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    decide_approval(&state, &approval_id, ApprovalStatus::Rejected).await
}

/// Resolving a conflict spawns a child run scoped to the disputed topic.
async fn resolve_conflict(
    State(state): State<AppState>,
    Path((run_id, conflict_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let run = require_run(&state, &run_id).await?;
    let conflict = state
        .store
        .get_conflict(&conflict_id)
        .await?
        .filter(|conflict| conflict.run_id == run_id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Конфликт не найден"))?;

    state
        .store
        .update_conflict_status(&conflict_id, ConflictStatus::Resolved)
        .await?;
    let child = state
        .store
        .create_run(
            &run.project_id,
            &format!("Разреши противоречие: {}", conflict.topic),
            RunMode::Research,
            Some(&run_id),
            Some("conflict_resolution"),
            json!({ "conflict_id": conflict_id }),
        )
        .await?;
    state
        .bus
        .emit_info(
            &child.id,
            astra_types::EventType::RunCreated,
            "Запуск создан",
            json!({
                "project_id": child.project_id,
                "mode": child.mode.as_str(),
                "query_text": child.query_text,
                "parent_run_id": run_id,
            }),
        )
        .await?;
    Ok(Json(json!({ "conflict_id": conflict_id, "child_run": child })))
}

// ============================================================================
// Memory
// ============================================================================

async fn memory_create(
    State(state): State<AppState>,
    Json(payload): Json<MemoryCreate>,
) -> Result<Json<Value>, ApiError> {
    let memory = state
        .store
        .create_user_memory(
            payload.title.as_deref(),
            &payload.content,
            &payload.tags,
            payload.source.as_deref().unwrap_or("manual"),
            None,
        )
        .await?;
    Ok(Json(serde_json::to_value(memory).map_err(AstraError::from)?))
}

async fn memory_list(
    State(state): State<AppState>,
    Query(query): Query<MemoryListQuery>,
) -> Result<Json<Value>, ApiError> {
    let memories = state
        .store
        .list_user_memories(query.limit.unwrap_or(50), query.query.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(memories).map_err(AstraError::from)?))
}

async fn memory_delete(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_user_memory(&memory_id).await? {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Запись не найдена"));
    }
    Ok(Json(json!({ "status": "deleted" })))
}

// ============================================================================
// Secrets
// ============================================================================

async fn secrets_unlock(
    State(state): State<AppState>,
    Json(payload): Json<UnlockPayload>,
) -> Result<Json<Value>, ApiError> {
    *state.runtime_passphrase.write().await = Some(payload.passphrase);
    Ok(Json(json!({ "status": "ok" })))
}

async fn secrets_openai(
    State(state): State<AppState>,
    Json(payload): Json<OpenAiPayload>,
) -> Result<Json<Value>, ApiError> {
    let passphrase = state.runtime_passphrase.read().await.clone();
    let Some(passphrase) = passphrase else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Хранилище не разблокировано",
        ));
    };
    let vault_path = state.data_dir.join("vault.bin");
    vault::set_secret(&vault_path, &passphrase, "OPENAI_API_KEY", &payload.api_key)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn secrets_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let unlocked = state.runtime_passphrase.read().await.is_some();
    Ok(Json(json!({ "vault_unlocked": unlocked })))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use astra_core::config::{AppConfig, ChatConfig, EpisodicConfig, MemoryConfig};
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_state(auth_mode: AuthMode) -> (AppState, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: tmp.path().to_path_buf(),
            auth_mode,
            chat: ChatConfig::from_env(),
            memory: MemoryConfig::from_env(),
            episodic: EpisodicConfig {
                db_path: tmp.path().join("episodic.sqlite3"),
                max_episodes: 50,
            },
        };
        (crate::build_state(config).unwrap(), tmp)
    }

    #[tokio::test]
    async fn auth_status_is_open_in_strict_mode() {
        let (state, _tmp) = test_state(AuthMode::Strict);
        let app = app_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/auth/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn strict_mode_requires_token() {
        let (state, tmp) = test_state(AuthMode::Strict);
        let token = astra_core::auth::ensure_session_token(&state.store, tmp.path())
            .await
            .unwrap();
        let app = app_router(state);

        let denied = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects")
                    .method("GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects")
                    .method("GET")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn strict_mode_rejects_bad_scheme_and_bad_token() {
        let (state, tmp) = test_state(AuthMode::Strict);
        astra_core::auth::ensure_session_token(&state.store, tmp.path())
            .await
            .unwrap();
        let app = app_router(state);

        let bad_scheme = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects")
                    .method("GET")
                    .header("Authorization", "Basic abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad_scheme.status(), StatusCode::UNAUTHORIZED);

        let bad_token = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects")
                    .method("GET")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad_token.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn local_mode_passes_without_client_address() {
        let (state, _tmp) = test_state(AuthMode::Local);
        let app = app_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects")
                    .method("GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bootstrap_statuses_follow_contract() {
        let (state, _tmp) = test_state(AuthMode::Local);
        let app = app_router(state);

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/auth/bootstrap")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "token": "t-1" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = axum::body::to_bytes(first.into_body(), 1024).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["status"], "created");

        let second = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/auth/bootstrap")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "token": "t-1" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(second.into_body(), 1024).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["status"], "ok");

        let conflict = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/auth/bootstrap")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "token": "t-2" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let (state, _tmp) = test_state(AuthMode::Local);
        let app = app_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/runs/missing/snapshot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn secrets_require_unlock_before_write() {
        let (state, _tmp) = test_state(AuthMode::Local);
        let app = app_router(state);

        let denied = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/secrets/openai")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "api_key": "sk-x" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::BAD_REQUEST);

        let unlock = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/secrets/unlock")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "passphrase": "p" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unlock.status(), StatusCode::OK);

        let status = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/secrets/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(status.into_body(), 1024).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap()["vault_unlocked"],
            true
        );
    }
}
