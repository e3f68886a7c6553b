//!
//! portal HTTP server
//! ------------------
//! Axum-based HTTP API for the checklist portal.
//!
//! Responsibilities:
//! - Session management with a cookie + CSRF token model.
//! - Login/logout endpoints backed by the user directory.
//! - Route gate queries so the UI can decide redirect / denial / render per view.
//! - Task listing, proof submission, assignment and admin review, each behind the gate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::backend::BackendClient;
use crate::config::PortalConfig;
use crate::error::AppError;
use crate::identity::{
    AccessGate, AuthProvider, DecisionCache, DirectoryAuthProvider, GateParams, LoginError, LoginRequest,
    MemoryUserDirectory, RequestContext, RestUserDirectory, Role, Session, SessionManager, UserDirectory,
    UserRecord, Verdict, SESSION_COOKIE,
};
use crate::routes;
use crate::tasks::{MemoryTaskRepository, NewTask, RestTaskRepository, Task, TaskBoard, TaskRepository, TaskStatus};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PortalConfig>,
    pub sessions: SessionManager,
    pub gate: AccessGate,
    pub auth: Arc<dyn AuthProvider>,
    pub tasks: TaskBoard,
}

impl AppState {
    pub fn new(config: PortalConfig, directory: Arc<dyn UserDirectory>, tasks: Arc<dyn TaskRepository>) -> Self {
        let sessions = SessionManager::new(Duration::from_secs(config.session_ttl_secs));
        let cache = DecisionCache::new(
            Duration::from_millis(config.authz_cache_allow_ms),
            Duration::from_millis(config.authz_cache_deny_ms),
        );
        let gate = AccessGate::new(directory.clone()).with_cache(cache);
        let auth: Arc<dyn AuthProvider> = Arc::new(DirectoryAuthProvider::new(directory, sessions.clone()));
        Self { config: Arc::new(config), sessions, gate, auth, tasks: TaskBoard::new(tasks) }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Wire the directory and task table to the hosted backend, or to in-memory tables
/// (optionally seeded from `seed_file`) when no backend URL is configured.
pub fn build_state(config: PortalConfig) -> anyhow::Result<AppState> {
    if let Some(url) = config.backend_url.as_deref() {
        let client = BackendClient::new(url, config.backend_key.as_deref(), Duration::from_millis(config.backend_timeout_ms))?;
        info!(target: "startup", backend = %url, "using hosted backend");
        let directory: Arc<dyn UserDirectory> = Arc::new(RestUserDirectory::new(client.clone()));
        let tasks: Arc<dyn TaskRepository> = Arc::new(RestTaskRepository::new(client));
        return Ok(AppState::new(config, directory, tasks));
    }
    let seed = match config.seed_file.as_deref() {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading seed file {}", path))?;
            serde_json::from_slice::<Seed>(&bytes).with_context(|| format!("parsing seed file {}", path))?
        }
        None => {
            warn!(target: "startup", "no PORTAL_BACKEND_URL or PORTAL_SEED_FILE; starting with empty in-memory tables");
            Seed::default()
        }
    };
    info!(target: "startup", users = seed.users.len(), tasks = seed.tasks.len(), "using in-memory backend");
    let directory: Arc<dyn UserDirectory> = Arc::new(MemoryUserDirectory::from_records(seed.users));
    let tasks: Arc<dyn TaskRepository> = Arc::new(MemoryTaskRepository::from_tasks(seed.tasks));
    Ok(AppState::new(config, directory, tasks))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "portal ok" }))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/csrf", get(get_csrf))
        .route("/session", get(session_info))
        .route("/gate", get(gate_check))
        .route("/gate/state", get(gate_state))
        .route("/tasks", get(tasks_list).post(tasks_assign))
        .route("/tasks/pending", get(tasks_pending))
        .route("/tasks/{id}/submit", post(tasks_submit))
        .route("/tasks/{id}/approve", post(tasks_approve))
        .route("/tasks/{id}/reject", post(tasks_reject))
        .with_state(state)
}

/// Serve on an already-bound listener until the server stops.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    // Background sweep of expired sessions
    {
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let removed = sessions.prune_expired();
                if removed > 0 { debug!(removed = removed, "session_sweep"); }
            }
        });
    }
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub async fn run(config: PortalConfig) -> anyhow::Result<()> {
    let port = config.http_port;
    let state = build_state(config)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state).await
}

#[derive(Debug, Deserialize)]
struct LoginPayload { username: String, password: String }

#[derive(Debug, Deserialize)]
struct GateQuery { path: String }

#[derive(Debug, Deserialize)]
struct ListQuery { status: Option<String> }

#[derive(Debug, Deserialize)]
struct SubmitPayload { proof_url: String }

#[derive(Debug, Default, Deserialize)]
struct ReviewPayload {
    #[serde(default)]
    remarks: Option<String>,
}

fn set_session_cookie(token: &str, secure: bool) -> Option<HeaderValue> {
    let secure = if secure { " Secure;" } else { "" };
    HeaderValue::from_str(&format!("{}={}; HttpOnly;{} SameSite=Strict; Path=/", SESSION_COOKIE, token, secure)).ok()
}

fn clear_session_cookie(secure: bool) -> Option<HeaderValue> {
    let secure = if secure { " Secure;" } else { "" };
    HeaderValue::from_str(&format!(
        "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly;{} SameSite=Strict; Path=/",
        SESSION_COOKIE, secure
    )).ok()
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers.get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn redirect_response() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized", "location": routes::LOGIN_PATH}))).into_response()
}

async fn login(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<LoginPayload>) -> Response {
    let req = LoginRequest { username: payload.username, password: payload.password, ip: client_ip(&headers) };
    match state.auth.login(&req).await {
        Ok(resp) => {
            let mut h = HeaderMap::new();
            if let Some(c) = set_session_cookie(&resp.session.token, state.config.secure_cookies) {
                h.insert("Set-Cookie", c);
            }
            let body = json!({
                "status": "ok",
                "username": resp.state.username,
                "role": resp.state.role,
                "user_access": resp.state.user_access,
                "department": resp.state.department,
                "landing": resp.landing,
                "csrf": resp.session.csrf,
            });
            (StatusCode::OK, h, Json(body)).into_response()
        }
        Err(LoginError::InvalidCredentials) => {
            (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized", "error": "invalid username or password"}))).into_response()
        }
        Err(LoginError::Inactive) => {
            (StatusCode::FORBIDDEN, Json(json!({"status": "inactive", "error": "account is inactive"}))).into_response()
        }
        Err(e @ (LoginError::Lookup(_) | LoginError::Session(_))) => {
            error!("login error: {e}");
            AppError::backend("login_unavailable", "login is temporarily unavailable").into_response()
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    if !ctx.csrf_ok() {
        return AppError::csrf("invalid_csrf", "invalid csrf").into_response();
    }
    if let Some(token) = ctx.token.as_deref() {
        if let Some(session) = &ctx.session { session.gate.reset(); }
        if let Some(username) = state.sessions.logout(token) {
            state.gate.cache().invalidate_user(&username);
            info!(target: "auth", user = %username, "logout");
        }
    }
    let mut h = HeaderMap::new();
    if let Some(c) = clear_session_cookie(state.config.secure_cookies) {
        h.insert("Set-Cookie", c);
    }
    (StatusCode::OK, h, Json(json!({"status": "ok", "location": routes::LOGIN_PATH}))).into_response()
}

async fn get_csrf(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    match (&ctx.session, ctx.username()) {
        (Some(s), Some(_)) => (StatusCode::OK, Json(json!({"status": "ok", "csrf": s.csrf}))).into_response(),
        _ => redirect_response(),
    }
}

async fn session_info(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let Some(session) = ctx.session.filter(|s| !s.store.is_empty()) else {
        return redirect_response();
    };
    (StatusCode::OK, Json(json!({"status": "ok", "session": session.store.snapshot()}))).into_response()
}

/// Gate verdict for a routed view. Always 200 unless the path is unknown or the
/// activation was superseded; the verdict body tells the UI what to render.
async fn gate_check(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<GateQuery>) -> Response {
    let Some(route) = routes::resolve(&q.path) else {
        return AppError::not_found("unknown_route".to_string(), format!("no protected route {}", q.path)).into_response();
    };
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let Some(session) = ctx.session else {
        let v = Verdict::RedirectToLogin { location: routes::LOGIN_PATH.to_string() };
        return (StatusCode::OK, Json(json!({"path": route.path, "result": v}))).into_response();
    };
    let username = session.store.username();
    match state.gate.activate(&session.gate, &session.store, &route.params()).await {
        Some(v) => {
            if v.is_redirect() { end_user_sessions(&state, &session, username.as_deref()); }
            (StatusCode::OK, Json(json!({"path": route.path, "result": v}))).into_response()
        }
        None => AppError::conflict("gate_superseded", "a newer navigation replaced this check").into_response(),
    }
}

async fn gate_state(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let Some(session) = ctx.session else { return redirect_response(); };
    (StatusCode::OK, Json(json!({"state": session.gate.state()}))).into_response()
}

/// After a gate redirect: a session that is still registered but was emptied by
/// the gate belongs to a deactivated account, so drop every session that user
/// still holds. A session ended by logout or expiry meanwhile is left alone.
fn end_user_sessions(state: &AppState, session: &Session, username: Option<&str>) {
    let Some(username) = username else { return; };
    if !(session.store.is_empty() && state.sessions.contains(&session.token)) { return; }
    let n = state.sessions.revoke_user(username);
    state.gate.cache().invalidate_user(username);
    info!(target: "auth", user = %username, sessions = n, "sessions revoked after deactivation");
}

/// Run the gate for an API call. Yields the session, username and role on success.
/// Data requests are independent of view navigation, so they neither supersede
/// one another nor touch the session's navigation gate state.
async fn guard(state: &AppState, ctx: &RequestContext, params: &GateParams) -> Result<(Session, String, Role), Response> {
    let Some(session) = ctx.session.clone() else { return Err(redirect_response()); };
    let username = session.store.username();
    match state.gate.evaluate(&session.store, params).await {
        Verdict::Authorized { role } => {
            let Some(username) = username else { return Err(redirect_response()); };
            Ok((session, username, role))
        }
        Verdict::RedirectToLogin { .. } => {
            end_user_sessions(state, &session, username.as_deref());
            Err(redirect_response())
        }
        v @ Verdict::Denied { .. } => {
            debug!(request_id = %ctx.request_id, "api call denied");
            Err((StatusCode::FORBIDDEN, Json(json!({"status": "forbidden", "result": v}))).into_response())
        }
    }
}

fn require_csrf(ctx: &RequestContext) -> Result<(), Response> {
    if ctx.csrf_ok() { Ok(()) } else { Err(AppError::csrf("invalid_csrf", "invalid csrf").into_response()) }
}

fn tasks_body(tasks: Vec<Task>) -> Response {
    (StatusCode::OK, Json(json!({"status": "ok", "count": tasks.len(), "tasks": tasks}))).into_response()
}

fn task_body(task: Task) -> Response {
    (StatusCode::OK, Json(json!({"status": "ok", "task": task}))).into_response()
}

async fn tasks_list(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ListQuery>) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let (_, username, role) = match guard(&state, &ctx, &routes::tasks_view()).await {
        Ok(g) => g,
        Err(r) => return r,
    };
    let status = match q.status.as_deref().map(str::parse::<TaskStatus>).transpose() {
        Ok(s) => s,
        Err(e) => return AppError::user("bad_status".to_string(), e).into_response(),
    };
    match state.tasks.list_for(&username, role, status).await {
        Ok(tasks) => tasks_body(tasks),
        Err(e) => e.into_response(),
    }
}

async fn tasks_pending(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    if let Err(r) = guard(&state, &ctx, &routes::tasks_review()).await { return r; }
    match state.tasks.pending_review().await {
        Ok(tasks) => tasks_body(tasks),
        Err(e) => e.into_response(),
    }
}

async fn tasks_assign(State(state): State<AppState>, headers: HeaderMap, Json(new): Json<NewTask>) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let (_, username, _) = match guard(&state, &ctx, &routes::tasks_assign()).await {
        Ok(g) => g,
        Err(r) => return r,
    };
    if let Err(r) = require_csrf(&ctx) { return r; }
    match state.tasks.assign(&username, new).await {
        Ok(t) => (StatusCode::CREATED, Json(json!({"status": "ok", "task": t}))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn tasks_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<SubmitPayload>,
) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let (_, username, _) = match guard(&state, &ctx, &routes::tasks_view()).await {
        Ok(g) => g,
        Err(r) => return r,
    };
    if let Err(r) = require_csrf(&ctx) { return r; }
    match state.tasks.submit(&username, &id, &payload.proof_url).await {
        Ok(t) => task_body(t),
        Err(e) => e.into_response(),
    }
}

async fn tasks_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ReviewPayload>,
) -> Response {
    review(state, headers, id, payload, true).await
}

async fn tasks_reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ReviewPayload>,
) -> Response {
    review(state, headers, id, payload, false).await
}

async fn review(state: AppState, headers: HeaderMap, id: String, payload: ReviewPayload, approve: bool) -> Response {
    let ctx = RequestContext::from_headers(&state.sessions, &headers);
    let (_, reviewer, _) = match guard(&state, &ctx, &routes::tasks_review()).await {
        Ok(g) => g,
        Err(r) => return r,
    };
    if let Err(r) = require_csrf(&ctx) { return r; }
    let res = if approve {
        state.tasks.approve(&reviewer, &id, payload.remarks).await
    } else {
        state.tasks.reject(&reviewer, &id, payload.remarks).await
    };
    match res {
        Ok(t) => task_body(t),
        Err(e) => e.into_response(),
    }
}
