//! HTTP routes for the reference server

use axum::{
    extract::{rejection::JsonRejection, MatchedPath, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use arbor_common::{NodeType, Role, ServerConfig, Visibility};

use crate::auth::{self, TokenKeys};
use crate::store::{NewNode, NodeRow, Store, UserRow};

const MAX_BODY_CHARS: usize = 10_000;
const MAX_TREE_DEPTH: u32 = 10;

/// Shared handler state
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub keys: TokenKeys,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let keys = TokenKeys::new(&config.auth.jwt_secret, config.auth.token_expiry_min);
        Self { config, store, keys }
    }

    fn caller(&self, headers: &HeaderMap) -> Result<Option<UserRow>, ApiError> {
        let Some(token) = auth::bearer_token(headers) else {
            return Ok(None);
        };
        let claims = self.keys.verify(&token).ok_or(ApiError::Unauthorized)?;
        // Role is read fresh so promotions apply without a new token.
        let user = self.store.user_by_id(&claims.sub)?.ok_or(ApiError::Unauthorized)?;
        Ok(Some(user))
    }

    fn require_caller(&self, headers: &HeaderMap) -> Result<UserRow, ApiError> {
        self.caller(headers)?.ok_or(ApiError::Unauthorized)
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<arbor_common::Error> for ApiError {
    fn from(e: arbor_common::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(msg) => {
                warn!("Internal error: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/bot/status", get(bot_status_handler))
        .route("/api/bot/answer/:id", post(bot_answer_handler))
        .route("/api/register", post(register_handler))
        .route("/api/login", post(login_handler))
        .route("/api/me", get(me_handler))
        .route("/api/ask", post(ask_handler))
        .route("/api/answer", post(answer_handler))
        .route("/api/questions", get(questions_handler))
        .route("/api/node/:id", get(get_node_handler).delete(delete_node_handler))
        .route("/api/node/:id/clone", post(clone_node_handler))
        .route("/api/tree/:id", get(tree_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), metrics_middleware))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Middleware
// ============================================================================

async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    response
}

async fn metrics_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    if let Err(e) = state.store.bump_metric(&method, &path) {
        debug!("Metric update failed for {} {}: {}", method, path, e);
    }
    next.run(req).await
}

async fn not_found_handler() -> ApiError {
    ApiError::NotFound("route")
}

// ============================================================================
// Bot
// ============================================================================

async fn bot_status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let bot = &state.config.bot;
    Json(json!({
        "enabled": bot.enabled,
        "handle": bot.handle,
        "has_llm": state.config.llm.has_provider(),
        "credit_per_day": bot.credit_per_day,
        "default_provider": bot.default_provider,
        "default_model": bot.default_model,
    }))
}

async fn bot_answer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = state.caller(&headers)?;
    let node = visible_node(&state, &id, caller.as_ref())?;

    if !state.config.bot.enabled {
        return Err(ApiError::Unavailable("bot is disabled".to_string()));
    }
    if !state.config.llm.has_provider() {
        return Err(ApiError::Unavailable("no LLM provider configured".to_string()));
    }

    let flow_id = state
        .store
        .record_flow(&node.id, "bot_answer", &[("received", "ok"), ("queued", "pending")])?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "queued": true,
            "node_id": node.id,
            "flow_id": flow_id,
            "provider": state.config.bot.default_provider,
        })),
    ))
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    handle: String,
    password: String,
}

fn session_body(state: &AppState, user: &UserRow) -> ApiResult<Value> {
    let token = state
        .keys
        .issue(&user.id, &user.handle)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(json!({ "user": user, "token": token }))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    auth::validate_handle(&req.handle).map_err(ApiError::BadRequest)?;
    auth::validate_password(&req.password).map_err(ApiError::BadRequest)?;

    let user = state
        .store
        .create_user(&req.handle, &auth::hash_password(&req.password))?
        .ok_or_else(|| ApiError::Conflict(format!("handle '{}' is already taken", req.handle)))?;

    Ok((StatusCode::CREATED, Json(session_body(&state, &user)?)))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body?;
    let user = state
        .store
        .user_by_handle(&req.handle)?
        .filter(|u| auth::verify_password(&req.password, &u.password_hash))
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(session_body(&state, &user)?))
}

async fn me_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<UserRow>> {
    Ok(Json(state.require_caller(&headers)?))
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Deserialize)]
struct AskRequest {
    body: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    visibility: Option<Visibility>,
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    parent_id: String,
    body: String,
    #[serde(rename = "type", default)]
    node_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeQuery {
    depth: Option<u32>,
}

fn validate_body(body: &str) -> ApiResult<&str> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("body must not be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::BadRequest(format!(
            "body exceeds {} characters",
            MAX_BODY_CHARS
        )));
    }
    Ok(trimmed)
}

fn can_read(node: &NodeRow, caller: Option<&UserRow>) -> bool {
    let role = caller.map(|u| u.role).unwrap_or(Role::Anon);
    node.visibility.min_role() <= role
}

/// Live node the caller may read, otherwise 404.
fn visible_node(state: &AppState, id: &str, caller: Option<&UserRow>) -> ApiResult<NodeRow> {
    state
        .store
        .node(id)?
        .filter(|n| can_read(n, caller))
        .ok_or(ApiError::NotFound("node"))
}

fn node_json(node: &NodeRow, flow_id: Option<String>) -> Value {
    let mut value = json!(node);
    if let (Some(flow_id), Some(obj)) = (flow_id, value.as_object_mut()) {
        obj.insert("flow_id".to_string(), Value::String(flow_id));
    }
    value
}

async fn ask_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let caller = state.require_caller(&headers)?;
    let Json(req) = body?;
    let text = validate_body(&req.body)?;

    let node = state.store.insert_node(NewNode {
        body: text,
        node_type: NodeType::Claim,
        parent: None,
        visibility: req.visibility.unwrap_or_default(),
        author_id: &caller.id,
        clone_of: None,
        tags: &req.tags,
    })?;
    let flow_id = state.store.record_flow(
        &node.id,
        "ask",
        &[("received", "ok"), ("validated", "ok"), ("stored", "ok")],
    )?;

    Ok((StatusCode::CREATED, Json(node_json(&node, Some(flow_id)))))
}

async fn answer_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<AnswerRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let caller = state.require_caller(&headers)?;
    let Json(req) = body?;
    let text = validate_body(&req.body)?;
    let node_type: NodeType = match req.node_type.as_deref() {
        None => NodeType::Piece,
        Some(raw) => raw.parse().map_err(ApiError::BadRequest)?,
    };
    let parent = visible_node(&state, &req.parent_id, Some(&caller))?;

    let node = state.store.insert_node(NewNode {
        body: text,
        node_type,
        parent: Some(&parent),
        visibility: parent.visibility,
        author_id: &caller.id,
        clone_of: None,
        tags: &[],
    })?;
    let flow_id = state.store.record_flow(
        &node.id,
        "answer",
        &[("received", "ok"), ("validated", "ok"), ("linked", "ok"), ("stored", "ok")],
    )?;

    Ok((StatusCode::CREATED, Json(node_json(&node, Some(flow_id)))))
}

async fn get_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let caller = state.caller(&headers)?;
    let node = visible_node(&state, &id, caller.as_ref())?;
    Ok(Json(node_json(&node, None)))
}

async fn delete_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let caller = state.require_caller(&headers)?;
    let node = visible_node(&state, &id, Some(&caller))?;

    let is_author = node.author_id.as_deref() == Some(caller.id.as_str());
    if !is_author && caller.role < Role::Operator {
        return Err(ApiError::Forbidden);
    }
    if !state.store.soft_delete(&node.id)? {
        return Err(ApiError::NotFound("node"));
    }
    Ok(Json(json!({ "id": node.id, "deleted": true })))
}

async fn clone_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = state.require_caller(&headers)?;
    let source = visible_node(&state, &id, Some(&caller))?;

    let clone = state.store.insert_node(NewNode {
        body: &source.body,
        node_type: NodeType::Claim,
        parent: None,
        visibility: source.visibility,
        author_id: &caller.id,
        clone_of: Some(&source.id),
        tags: &source.tags,
    })?;
    Ok((StatusCode::CREATED, Json(node_json(&clone, None))))
}

async fn questions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let caller = state.caller(&headers)?;
    let questions: Vec<NodeRow> = state
        .store
        .questions()?
        .into_iter()
        .filter(|n| can_read(n, caller.as_ref()))
        .collect();
    Ok(Json(json!({ "questions": questions })))
}

async fn tree_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TreeQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let caller = state.caller(&headers)?;
    let root = visible_node(&state, &id, caller.as_ref())?;
    let depth = query.depth.unwrap_or(1).min(MAX_TREE_DEPTH);
    Ok(Json(subtree(&state, root, depth, caller.as_ref())?))
}

fn subtree(state: &AppState, node: NodeRow, depth: u32, caller: Option<&UserRow>) -> ApiResult<Value> {
    let mut value = node_json(&node, None);
    let children = if depth == 0 {
        Vec::new()
    } else {
        state
            .store
            .children(&node.id)?
            .into_iter()
            .filter(|c| can_read(c, caller))
            .map(|c| subtree(state, c, depth - 1, caller))
            .collect::<ApiResult<Vec<_>>>()?
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("children".to_string(), Value::Array(children));
    }
    Ok(value)
}
