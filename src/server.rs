//! HTTP surface of the gateway.
//!
//! Thin axum handlers over the core: parse the inbound wire format, hand the
//! canonical request to the router, stream or return the translated response,
//! and record the exchange. Recording is always detached from the response
//! path — a storage failure is logged, never surfaced to the caller.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::canonical::{CanonicalChunk, CanonicalRequest, TokenUsage, WireFormat};
use crate::error::GatewayError;
use crate::providers::ChunkStream;
use crate::router::ModelRouter;
use crate::storage::{Exchange, Outcome, StorageService};
use crate::translate;
use crate::translate::streaming::{AnthropicEventWriter, ChunkAssembler, OpenAiChunkWriter};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub storage: StorageService,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route(
            "/api/requests",
            get(handle_list_requests).delete(handle_delete_requests),
        )
        .route("/api/conversations", get(handle_list_conversations))
        .route(
            "/api/conversations/project",
            get(handle_conversations_by_project),
        )
        .route("/api/conversations/:id", get(handle_get_conversation))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Completion endpoints
// ---------------------------------------------------------------------------

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_completion(state, WireFormat::Anthropic, body).await
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_completion(state, WireFormat::OpenAi, body).await
}

async fn handle_completion(state: Arc<AppState>, format: WireFormat, body: Bytes) -> Response {
    let received = Instant::now();
    let raw_request: serde_json::Value =
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);

    let req = match translate::request_to_canonical(format, &body) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(%format, "rejected request: {e}");
            // No route decision exists yet; record with an empty provider.
            let meta = ExchangeMeta {
                format,
                provider: String::new(),
                requested_model: raw_request
                    .get("model")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string(),
                upstream_model: String::new(),
                request_body: raw_request,
                correlation_key: "anonymous".to_string(),
                project_id: None,
                received,
            };
            record_detached(
                state.storage.clone(),
                meta.into_exchange(Outcome::Error, None, TokenUsage::default(), Some(e.to_string())),
            );
            return error_response(format, &e);
        }
    };

    let decision = state.router.route(&req.model);
    tracing::info!(
        model = %req.model,
        provider = %decision.provider,
        upstream_model = %decision.upstream_model,
        streaming = req.stream,
        "routing request"
    );

    let meta = ExchangeMeta {
        format,
        provider: decision.provider,
        requested_model: req.model.clone(),
        upstream_model: decision.upstream_model,
        request_body: raw_request,
        correlation_key: req.metadata.correlation_key(),
        project_id: req.metadata.project_id.clone(),
        received,
    };

    if req.stream {
        handle_streaming(state, format, req, meta).await
    } else {
        handle_unary(state, format, req, meta).await
    }
}

async fn handle_unary(
    state: Arc<AppState>,
    format: WireFormat,
    req: CanonicalRequest,
    meta: ExchangeMeta,
) -> Response {
    // The guard records a canceled exchange if the caller disconnects while
    // the upstream call is in flight.
    let mut recorder = ExchangeRecorder::new(state.storage.clone(), meta);

    match state.router.execute(&req).await {
        Ok(mut resp) => {
            // The caller sees the model it asked for, not the upstream name.
            resp.model = req.model.clone();
            let usage = resp.usage;

            let payload = match translate::response_from_canonical(format, &resp) {
                Ok(p) => p,
                Err(e) => {
                    recorder.record_now(Outcome::Error, None, usage, Some(e.to_string()));
                    return error_response(format, &e);
                }
            };

            recorder.record_now(Outcome::Success, Some(payload.clone()), usage, None);
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(e) => {
            tracing::error!("upstream call failed: {e}");
            recorder.record_now(Outcome::Error, None, TokenUsage::default(), Some(e.to_string()));
            error_response(format, &e)
        }
    }
}

async fn handle_streaming(
    state: Arc<AppState>,
    format: WireFormat,
    req: CanonicalRequest,
    meta: ExchangeMeta,
) -> Response {
    let chunks = match state.router.execute_stream(&req).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("stream setup failed: {e}");
            record_detached(
                state.storage.clone(),
                meta.into_exchange(Outcome::Error, None, TokenUsage::default(), Some(e.to_string())),
            );
            return error_response(format, &e);
        }
    };

    let recorder = ExchangeRecorder::new(state.storage.clone(), meta);
    let model = req.model.clone();

    let events: EventStream = match format {
        WireFormat::Anthropic => Box::pin(anthropic_sse(chunks, model, recorder)),
        WireFormat::OpenAi => Box::pin(openai_sse(chunks, model, recorder)),
    };

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

type EventStream = std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Forward canonical chunks as Anthropic SSE events.
fn anthropic_sse(
    mut chunks: ChunkStream,
    model: String,
    mut recorder: ExchangeRecorder,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream! {
        let mut writer = AnthropicEventWriter::new(&model);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    recorder.observe(&chunk);
                    for event in writer.process(&chunk) {
                        if let Ok(json) = serde_json::to_string(&event) {
                            yield Ok(Event::default().event(event.event_name()).data(json));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("stream failed mid-flight: {e}");
                    let body = translate::error_body(WireFormat::Anthropic, e.http_status(), &e.to_string());
                    recorder.fail(e.to_string());
                    yield Ok(Event::default().event("error").data(body.to_string()));
                    return;
                }
            }
        }

        recorder.complete(WireFormat::Anthropic);
    }
}

/// Forward canonical chunks as OpenAI streaming chunks, closed by `[DONE]`.
fn openai_sse(
    mut chunks: ChunkStream,
    model: String,
    mut recorder: ExchangeRecorder,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream! {
        let mut writer = OpenAiChunkWriter::new(&model);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    recorder.observe(&chunk);
                    for frame in writer.process(&chunk) {
                        if let Ok(json) = serde_json::to_string(&frame) {
                            yield Ok(Event::default().data(json));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("stream failed mid-flight: {e}");
                    let body = translate::error_body(WireFormat::OpenAi, e.http_status(), &e.to_string());
                    recorder.fail(e.to_string());
                    yield Ok(Event::default().data(body.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
            }
        }

        recorder.complete(WireFormat::OpenAi);
        yield Ok(Event::default().data("[DONE]"));
    }
}

// ---------------------------------------------------------------------------
// Exchange recording
// ---------------------------------------------------------------------------

struct ExchangeMeta {
    format: WireFormat,
    provider: String,
    requested_model: String,
    upstream_model: String,
    request_body: serde_json::Value,
    correlation_key: String,
    project_id: Option<String>,
    received: Instant,
}

impl ExchangeMeta {
    fn into_exchange(
        self,
        outcome: Outcome,
        response_body: Option<serde_json::Value>,
        usage: TokenUsage,
        error: Option<String>,
    ) -> Exchange {
        Exchange {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            inbound_format: self.format,
            provider: self.provider,
            requested_model: self.requested_model,
            upstream_model: self.upstream_model,
            request_body: self.request_body,
            response_body,
            latency_ms: self.received.elapsed().as_millis() as i64,
            outcome,
            error,
            usage,
            correlation_key: self.correlation_key,
            project_id: self.project_id,
        }
    }
}

fn record_detached(storage: StorageService, exchange: Exchange) {
    tokio::spawn(async move {
        if let Err(e) = storage.record(&exchange).await {
            tracing::warn!("failed to record exchange: {e}");
        }
    });
}

/// Records an exchange exactly once, whatever way the request ends.
///
/// Unary handlers call [`record_now`](Self::record_now) when the outcome is
/// known. Streaming handlers feed chunks through [`observe`](Self::observe)
/// and call [`complete`](Self::complete) or [`fail`](Self::fail). If the
/// guard is dropped before any of those — the caller disconnected — the
/// `Drop` impl records a canceled exchange so aborted requests stay
/// observable.
struct ExchangeRecorder {
    storage: StorageService,
    meta: Option<ExchangeMeta>,
    assembler: ChunkAssembler,
    model: String,
}

impl ExchangeRecorder {
    fn new(storage: StorageService, meta: ExchangeMeta) -> Self {
        let model = meta.requested_model.clone();
        Self {
            storage,
            meta: Some(meta),
            assembler: ChunkAssembler::new(),
            model,
        }
    }

    fn observe(&mut self, chunk: &CanonicalChunk) {
        self.assembler.push(chunk);
    }

    fn record_now(
        &mut self,
        outcome: Outcome,
        response_body: Option<serde_json::Value>,
        usage: TokenUsage,
        error: Option<String>,
    ) {
        if let Some(meta) = self.meta.take() {
            record_detached(
                self.storage.clone(),
                meta.into_exchange(outcome, response_body, usage, error),
            );
        }
    }

    fn complete(&mut self, format: WireFormat) {
        let assembler = std::mem::take(&mut self.assembler);
        let truncated = !assembler.is_complete();

        let mut resp = assembler.into_response();
        resp.model = self.model.clone();
        let usage = resp.usage;
        let body = translate::response_from_canonical(format, &resp).ok();

        if truncated {
            self.record_now(
                Outcome::Error,
                body,
                usage,
                Some("stream ended before completion".to_string()),
            );
        } else {
            self.record_now(Outcome::Success, body, usage, None);
        }
    }

    fn fail(&mut self, error: String) {
        let assembler = std::mem::take(&mut self.assembler);
        let usage = assembler.into_response().usage;
        self.record_now(Outcome::Error, None, usage, Some(error));
    }
}

impl Drop for ExchangeRecorder {
    fn drop(&mut self) {
        let Some(meta) = self.meta.take() else { return };
        let assembler = std::mem::take(&mut self.assembler);
        let usage = assembler.into_response().usage;
        let exchange = meta.into_exchange(
            Outcome::Canceled,
            None,
            usage,
            Some("client disconnected".to_string()),
        );
        // Drop can run outside a runtime during shutdown; then the record is
        // best-effort lost, which storage semantics allow.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let storage = self.storage.clone();
            handle.spawn(async move {
                if let Err(e) = storage.record(&exchange).await {
                    tracing::warn!("failed to record canceled exchange: {e}");
                }
            });
        }
    }
}

fn error_response(format: WireFormat, err: &GatewayError) -> Response {
    let status = err.http_status();
    let body = translate::error_body(format, status, &err.to_string());
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Catalog and liveness
// ---------------------------------------------------------------------------

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .router
        .catalog()
        .await
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.owned_by,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Monitoring API
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListRequestsQuery {
    limit: Option<usize>,
}

async fn handle_list_requests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRequestsQuery>,
) -> Response {
    match state.storage.list_exchanges(query.limit).await {
        Ok(exchanges) => Json(exchanges).into_response(),
        Err(e) => storage_error(&e),
    }
}

async fn handle_delete_requests(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.delete_all().await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => storage_error(&e),
    }
}

async fn handle_list_conversations(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.list_conversations(None).await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => storage_error(&e),
    }
}

#[derive(Deserialize)]
struct ProjectQuery {
    project: Option<String>,
}

async fn handle_conversations_by_project(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
) -> Response {
    match state
        .storage
        .list_conversations(query.project.as_deref())
        .await
    {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => storage_error(&e),
    }
}

async fn handle_get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.storage.conversation(&id).await {
        Ok(Some(conversation)) => Json(conversation).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "conversation not found" })),
        )
            .into_response(),
        Err(e) => storage_error(&e),
    }
}

fn storage_error(err: &GatewayError) -> Response {
    tracing::error!("storage read failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
