//! HTTP admin surface: health check, schedule CRUD, webhook CRUD, and
//! on-demand refresh triggering. The router itself only knows about the two
//! narrow traits below — `ckb-daemon` wires its own `Scheduler` and
//! `RefreshManager` into implementations of them when it mounts this router,
//! the same "own the transport, borrow the behavior" split the teacher's
//! `helix-server` uses between `AppState` and its handlers.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use ckb_protocol::model::{Schedule, ScheduleFilter, TaskType, Webhook, WebhookFormat};
use ckb_protocol::CoreResult;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::webhooks::WebhookManager;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the admin router needs from whatever owns scheduling and refreshes.
/// `ckb-daemon`'s `Scheduler`/`RefreshManager` implement this directly.
///
/// `trigger_refresh` never blocks on the pipeline itself (spec §6.3 returns
/// 202 immediately): it only decides `queued` vs `already_queued` and, on
/// the former, hands the actual run off to the background.
pub trait DaemonControl: Send + Sync {
    fn has_pending_refresh(&self, repo_path: &str) -> bool;
    fn spawn_refresh(&self, repo_path: String, full: bool);
    fn add_schedule(&self, task_type: TaskType, target: String, expression: String) -> CoreResult<Schedule>;
    fn list_schedules(&self, filter: ScheduleFilter) -> CoreResult<Vec<Schedule>>;
    fn delete_schedule(&self, id: String) -> CoreResult<()>;
}

/// Health-check readings the admin `/health` route folds into its
/// response's `checks` map (spec §6.3). `ckb-daemon` supplies these from
/// whatever subsystems it wants surfaced (store handles, watcher liveness).
pub trait HealthChecks: Send + Sync {
    fn checks(&self) -> std::collections::BTreeMap<String, bool>;
}

#[derive(Clone)]
pub struct AdminState {
    pub control: Arc<dyn DaemonControl>,
    pub webhooks: Arc<WebhookManager>,
    pub pid: u32,
    pub started_at: std::time::Instant,
    pub health: Option<Arc<dyn HealthChecks>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/refresh", post(trigger_refresh))
        .route("/api/v1/schedules", get(list_schedules).post(create_schedule))
        .route("/api/v1/schedules/{id}", delete(delete_schedule))
        .route("/api/v1/webhooks", get(list_webhooks).post(create_webhook))
        .route("/api/v1/webhooks/{id}", delete(delete_webhook))
        .route("/api/v1/webhooks/{id}", put(update_webhook))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .route("/api/v1/dead-letters/{id}/retry", post(retry_dead_letter))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let checks = state.health.as_ref().map(|h| h.checks()).unwrap_or_default();
    let status = if checks.values().all(|ok| *ok) { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "checks": checks,
    }))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    repo_path: String,
    #[serde(default)]
    full: bool,
}

#[derive(Debug, Serialize)]
struct RefreshQueuedResponse {
    status: &'static str,
    repo: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

async fn trigger_refresh(
    State(state): State<AdminState>,
    Json(req): Json<RefreshRequest>,
) -> (StatusCode, Json<RefreshQueuedResponse>) {
    let kind = if req.full { "full" } else { "incremental" };
    let already_queued = state.control.has_pending_refresh(&req.repo_path);
    if !already_queued {
        state.control.spawn_refresh(req.repo_path.clone(), req.full);
    }
    let response = RefreshQueuedResponse {
        status: if already_queued { "already_queued" } else { "queued" },
        repo: req.repo_path,
        kind,
    };
    (StatusCode::ACCEPTED, Json(response))
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    task_type: TaskType,
    target: String,
    expression: String,
}

async fn create_schedule(
    State(state): State<AdminState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<Json<Schedule>, (StatusCode, String)> {
    state
        .control
        .add_schedule(req.task_type, req.target, req.expression)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn list_schedules(State(state): State<AdminState>) -> Result<Json<Vec<Schedule>>, (StatusCode, String)> {
    state
        .control
        .list_schedules(ScheduleFilter::default())
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn delete_schedule(
    State(state): State<AdminState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .control
        .delete_schedule(id)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Debug, Deserialize)]
struct CreateWebhookRequest {
    name: String,
    url: String,
    #[serde(default)]
    secret: Option<String>,
    events: HashSet<ckb_protocol::model::EventKind>,
    #[serde(default = "default_format")]
    format: WebhookFormat,
    #[serde(default)]
    headers: Vec<(String, String)>,
}

fn default_format() -> WebhookFormat {
    WebhookFormat::Json
}

async fn list_webhooks(State(state): State<AdminState>) -> Result<Json<Vec<Webhook>>, (StatusCode, String)> {
    state
        .webhooks
        .list_webhooks()
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn create_webhook(
    State(state): State<AdminState>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<Json<Webhook>, (StatusCode, String)> {
    state
        .webhooks
        .register_webhook(&req.name, &req.url, req.secret, req.events, req.format, req.headers)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Debug, Deserialize)]
struct UpdateWebhookRequest {
    enabled: Option<bool>,
    url: Option<String>,
}

async fn update_webhook(
    State(state): State<AdminState>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<Json<Webhook>, (StatusCode, String)> {
    let mut webhook = state
        .webhooks
        .list_webhooks()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .into_iter()
        .find(|w| w.id == id)
        .ok_or((StatusCode::NOT_FOUND, "webhook not found".to_string()))?;

    if let Some(enabled) = req.enabled {
        webhook.enabled = enabled;
    }
    if let Some(url) = req.url {
        webhook.url = url;
    }

    state
        .webhooks
        .update_webhook(&webhook)
        .map(|_| Json(webhook))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn delete_webhook(
    State(state): State<AdminState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .webhooks
        .delete_webhook(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Serialize)]
struct DeadLetterList {
    dead_letters: Vec<ckb_protocol::model::DeadLetter>,
}

async fn list_dead_letters(State(state): State<AdminState>) -> Result<Json<DeadLetterList>, (StatusCode, String)> {
    state
        .webhooks
        .list_dead_letters()
        .map(|dead_letters| Json(DeadLetterList { dead_letters }))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn retry_dead_letter(
    State(state): State<AdminState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .webhooks
        .retry_dead_letter(&id)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
