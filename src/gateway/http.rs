use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use super::{ChatCompletionRequest, Gateway, GatewayError, GatewayReply, UpstreamConfig};

pub const SERVICE_ID: &str = "azure-openai-proxy";
const SERVICE_NAME: &str = "Azure OpenAI Proxy";
const MODEL_CREATED: u64 = 1_677_610_602;
const MODEL_OWNER: &str = "azure-openai";

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    deployment: String,
    upstream_max_tokens: u32,
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway, upstream: &UpstreamConfig) -> Self {
        Self {
            gateway: Arc::new(gateway),
            deployment: upstream.deployment.clone(),
            upstream_max_tokens: upstream.max_tokens,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    detail: String,
}

fn error_response(status: StatusCode, detail: impl std::fmt::Display) -> Response {
    (
        status,
        Json(ErrorResponse {
            detail: detail.to_string(),
        }),
    )
        .into_response()
}

fn map_gateway_error(err: &GatewayError) -> Response {
    match err {
        GatewayError::RateLimited => error_response(StatusCode::TOO_MANY_REQUESTS, err),
        GatewayError::Upstream { .. } if err.is_upstream_rate_limit() => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            format_args!("Azure OpenAI rate limit exceeded: {err}"),
        ),
        GatewayError::Upstream { .. } => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
        GatewayError::InvalidRequest { .. } => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, err)
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "service": SERVICE_ID}))
}

async fn root(State(state): State<GatewayHttpState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "deployment": state.deployment,
        "max_tokens": state.upstream_max_tokens,
        "endpoints": [
            "/health - Health check",
            "/v1/models - List models",
            "/v1/chat/completions - Chat completions",
            "/metrics - Request counters",
        ],
    }))
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<super::ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

async fn list_models(State(state): State<GatewayHttpState>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.deployment,
            "object": "model",
            "created": MODEL_CREATED,
            "owned_by": MODEL_OWNER,
        }],
    }))
}

async fn chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    let span = tracing::info_span!(
        "chat_completion",
        request_id = %request_id,
        stream = tracing::field::Empty,
        cache = tracing::field::Empty,
    );

    let mut response = handle_chat_completion(&state, payload)
        .instrument(span)
        .await;
    insert_request_id(response.headers_mut(), &request_id);
    response
}

async fn handle_chat_completion(
    state: &GatewayHttpState,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = GatewayError::InvalidRequest {
                reason: rejection.body_text(),
            };
            tracing::debug!(error = %err, "rejected chat completion body");
            return map_gateway_error(&err);
        }
    };
    tracing::Span::current().record("stream", request.stream);

    match state.gateway.handle(&request).await {
        Ok(GatewayReply::Completion(completion)) => {
            tracing::Span::current().record("cache", completion.cache.as_str());
            tracing::info!("chat completion served");
            let mut response = Json(completion.response).into_response();
            response.headers_mut().insert(
                "x-aoai-cache",
                HeaderValue::from_static(completion.cache.as_str()),
            );
            response
        }
        Ok(GatewayReply::Stream(events)) => {
            tracing::info!("streaming chat completion");
            let body = Body::from_stream(events.map(|event| Ok::<_, Infallible>(event.encode())));
            let mut response = Response::new(body);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        }
        Err(err) => map_gateway_error(&err),
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("aoai-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let Ok(value) = HeaderValue::from_str(request_id) else {
        return;
    };
    headers.insert("x-request-id", value);
}
