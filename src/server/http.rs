//! HTTP API
//!
//! JSON request/response routes over the component registry. Errors are
//! shaped uniformly as `{"error": {"kind", "message"}, "isError": true}`
//! with one kind-to-status mapping for the whole surface. Request bodies
//! are size-bounded; validation happens in the handlers so the wire shape
//! of a rejection matches everything else.

use crate::core::error::Error;
use crate::core::types::{AdrStatus, PatternKind, SearchFilter, TaskType};
use crate::server::sse::{DeliverError, SseState, ToolCall, WireEvent};
use crate::server::{ComponentRegistry, ConnectionTracker};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 100;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ComponentRegistry>,
    pub tracker: Arc<ConnectionTracker>,
    pub sse: Arc<SseState>,
}

impl AppState {
    /// Record the error kind for alerting, then shape it for the wire
    fn fail(&self, error: Error) -> ApiError {
        self.registry.metrics.record_error(error.kind());
        ApiError(error)
    }
}

/// Build the full router
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/tools/analyze-code", post(analyze_code))
        .route("/tools/create-adr", post(create_adr))
        .route("/tools/debug-issue", post(debug_issue))
        .route("/tools/crawl-docs", post(crawl_docs))
        .route("/tools/search-knowledge", post(search_knowledge))
        .route("/tools/get-task/{id}", get(get_task))
        .route("/adrs", get(list_adrs))
        .route("/adrs/{id}", get(get_adr).patch(patch_adr))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/mcp/sse", get(open_sse))
        .route("/mcp/messages/{session}", post(deliver_message))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ));

    if !state.registry.config.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = state
            .registry
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::PATCH])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        );
    }

    router.with_state(state)
}

/// Readiness gate plus request counting; also enforces bearer auth when
/// enabled (health and metrics stay open for probes)
async fn track_requests(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(_guard) = state.tracker.request_start() else {
        return ApiError(Error::internal("server is shutting down"))
            .into_response_with_status(StatusCode::SERVICE_UNAVAILABLE);
    };
    state
        .registry
        .metrics
        .http_requests
        .fetch_add(1, Ordering::Relaxed);

    let path = request.uri().path();
    if state.registry.config.auth_enabled && path != "/health" && path != "/metrics" {
        let expected = state.registry.config.api_key.as_deref().unwrap_or("");
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected) {
            return ApiError(Error::validation("missing or invalid bearer token"))
                .into_response_with_status(StatusCode::UNAUTHORIZED);
        }
    }

    next.run(request).await
}

// ---- /tools ----

#[derive(Deserialize)]
struct AnalyzeCodeRequest {
    code: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

async fn analyze_code(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeCodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let code = require_non_empty(request.code.as_deref(), "code").map_err(|e| state.fail(e))?;
    let task_id = state
        .registry
        .tasks
        .submit(
            TaskType::AnalyzeCode,
            serde_json::json!({"code": code, "context": request.context}),
        )
        .map_err(|e| state.fail(e))?;
    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

#[derive(Deserialize)]
struct CreateAdrRequest {
    title: Option<String>,
    decision: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    consequences: Option<String>,
    #[serde(default)]
    options: Option<Vec<String>>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    supersedes: Option<String>,
}

async fn create_adr(
    State(state): State<AppState>,
    Json(request): Json<CreateAdrRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let title = require_non_empty(request.title.as_deref(), "title").map_err(|e| state.fail(e))?;
    let decision =
        require_non_empty(request.decision.as_deref(), "decision").map_err(|e| state.fail(e))?;

    // Considered options are folded into the context section.
    let mut context = request.context.unwrap_or_default();
    if let Some(options) = request.options.filter(|o| !o.is_empty()) {
        if !context.is_empty() {
            context.push_str("\n\n");
        }
        context.push_str("Considered options:\n");
        for option in options {
            context.push_str(&format!("- {option}\n"));
        }
    }

    let record = state
        .registry
        .adrs
        .create(crate::adr::AdrDraft {
            title: title.to_string(),
            decision: decision.to_string(),
            context,
            consequences: request.consequences.unwrap_or_default(),
            tags: request.tags,
            supersedes: request.supersedes,
        })
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(serde_json::to_value(record).map_err(|e| state.fail(e.into()))?))
}

#[derive(Deserialize)]
struct DebugIssueRequest {
    description: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

async fn debug_issue(
    State(state): State<AppState>,
    Json(request): Json<DebugIssueRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let description =
        require_non_empty(request.description.as_deref(), "description").map_err(|e| state.fail(e))?;
    let task_id = state
        .registry
        .tasks
        .submit(
            TaskType::DebugIssue,
            serde_json::json!({"description": description, "context": request.context}),
        )
        .map_err(|e| state.fail(e))?;
    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

#[derive(Deserialize)]
struct CrawlDocsRequest {
    urls: Option<Vec<String>>,
    source_type: Option<String>,
}

async fn crawl_docs(
    State(state): State<AppState>,
    Json(request): Json<CrawlDocsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let urls = request.urls.unwrap_or_default();
    if urls.is_empty() {
        return Err(state.fail(Error::validation("urls must be a non-empty array")));
    }
    for url in &urls {
        reqwest::Url::parse(url)
            .map_err(|_| state.fail(Error::validation(format!("malformed url '{url}'"))))?;
    }
    let source_type =
        require_non_empty(request.source_type.as_deref(), "source_type").map_err(|e| state.fail(e))?;

    let task_id = state
        .registry
        .tasks
        .submit(
            TaskType::CrawlDocs,
            serde_json::json!({"urls": urls, "source_type": source_type}),
        )
        .map_err(|e| state.fail(e))?;
    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

#[derive(Deserialize)]
struct SearchKnowledgeRequest {
    query: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn search_knowledge(
    State(state): State<AppState>,
    Json(request): Json<SearchKnowledgeRequest>,
) -> Result<Response, ApiError> {
    let query = require_non_empty(request.query.as_deref(), "query").map_err(|e| state.fail(e))?;
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let filter = match &request.kind {
        Some(kind) => {
            let kind = PatternKind::parse(kind)
                .ok_or_else(|| state.fail(Error::validation(format!("unknown kind '{kind}'"))))?;
            Some(SearchFilter {
                kinds: vec![kind],
                ..Default::default()
            })
        }
        None => None,
    };

    let outcome = state
        .registry
        .kb
        .search(query, limit, filter.as_ref())
        .await
        .map_err(|e| state.fail(e))?;

    let body = serde_json::json!({
        "results": outcome.hits,
        "count": outcome.hits.len(),
    });
    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        "x-cache",
        HeaderValue::from_static(if outcome.cache_hit { "hit" } else { "miss" }),
    );
    Ok(response)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state
        .registry
        .tasks
        .get(&id)
        .ok_or_else(|| state.fail(Error::not_found(format!("task {id}"))))?;
    Ok(Json(serde_json::to_value(task).map_err(|e| state.fail(e.into()))?))
}

// ---- /adrs ----

async fn list_adrs(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.registry.adrs.list();
    Ok(Json(serde_json::json!({
        "adrs": records,
        "count": records.len(),
    })))
}

async fn get_adr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .registry
        .adrs
        .get(&id)
        .ok_or_else(|| state.fail(Error::not_found(format!("adr {id}"))))?;
    Ok(Json(serde_json::to_value(record).map_err(|e| state.fail(e.into()))?))
}

#[derive(Deserialize)]
struct PatchAdrRequest {
    status: Option<String>,
    #[serde(default)]
    superseded_by: Option<String>,
}

async fn patch_adr(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PatchAdrRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = require_non_empty(request.status.as_deref(), "status").map_err(|e| state.fail(e))?;
    let status = AdrStatus::parse(status)
        .ok_or_else(|| state.fail(Error::validation(format!("unknown status '{status}'"))))?;

    let record = state
        .registry
        .adrs
        .transition(&id, status, request.superseded_by.as_deref())
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(serde_json::to_value(record).map_err(|e| state.fail(e.into()))?))
}

// ---- observability ----

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.health.snapshot().await;
    Json(serde_json::to_value(snapshot).unwrap_or_else(|_| serde_json::json!({"status": "unknown"})))
}

async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = serde_json::to_value(state.registry.metrics.snapshot())
        .unwrap_or_else(|_| serde_json::json!({}));

    body["cache"] = serde_json::to_value(state.registry.cache.stats())
        .unwrap_or_else(|_| serde_json::json!({}));
    body["tasks"]["states"] = serde_json::to_value(state.registry.tasks.state_histogram())
        .unwrap_or_else(|_| serde_json::json!({}));
    body["components"] = serde_json::to_value(state.registry.health.aggregate().components)
        .unwrap_or_else(|_| serde_json::json!({}));

    Json(body)
}

// ---- SSE transport ----

async fn open_sse(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (session_id, rx) = state.sse.open_session();
    tracing::info!(session = %session_id, "sse stream opened");

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|wire| (Ok::<_, Infallible>(to_sse_event(wire)), rx))
    });
    Sse::new(stream)
}

fn to_sse_event(wire: WireEvent) -> Event {
    Event::default()
        .event(wire.event)
        .data(wire.data.to_string())
}

async fn deliver_message(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(call): Json<ToolCall>,
) -> Result<StatusCode, ApiError> {
    match state.sse.deliver(&session, call) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(DeliverError::UnknownSession) => {
            Err(state.fail(Error::not_found(format!("session {session}"))))
        }
        Err(DeliverError::Backlogged) => Err(state.fail(Error::QueueFull)),
    }
}

// ---- helpers ----

fn require_non_empty<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, Error> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::validation(format!("{field} must be a non-empty string"))),
    }
}

/// Wire-shaped error with the uniform kind-to-status mapping
pub struct ApiError(pub Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AdrTransition { .. } => StatusCode::CONFLICT,
            Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::VectorUnavailable { .. } | Error::EmbedderUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::VectorSchemaMismatch { .. } | Error::Config { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response_with_status(self, status: StatusCode) -> Response {
        let body = serde_json::json!({
            "error": { "kind": self.0.kind(), "message": self.0.to_string() },
            "isError": true,
        });
        let mut response = (status, Json(body)).into_response();
        if matches!(self.0, Error::QueueFull) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        self.into_response_with_status(status)
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}
