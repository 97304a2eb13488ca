//! Completion gateway: admission, de-duplication and upstream dispatch.

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod http;
pub mod limits;
pub mod observability;
#[cfg(feature = "otel")]
pub mod otel;
pub mod retry;
pub mod telemetry;
pub mod upstream;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use cache::ResponseCache;
use limits::RateLimiter;
use observability::Observability;
use retry::RetryExecutor;

pub use cache::CacheConfig;
pub use config::{CredentialsConfig, GatewayConfig, ServerConfig};
pub use fingerprint::Fingerprint;
pub use http::{GatewayHttpState, router};
pub use limits::LimitsConfig;
pub use observability::ObservabilitySnapshot;
pub use retry::RetryConfig;
pub use upstream::{AzureOpenAiUpstream, Upstream, UpstreamConfig};

use crate::ProxyError;
use crate::utils::sse::{DONE_SENTINEL, encode_data_event};

/// Chat completion body as received from the client.
///
/// Only the fields the gateway inspects are typed; everything else is kept in
/// `extra` and forwarded unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<Value>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// An explicit `null` reads as `false`.
    #[serde(default, deserialize_with = "null_as_false")]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_false<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Option::<bool>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ChatCompletionRequest {
    pub fn fingerprint(&self, defaults: &CacheConfig) -> Fingerprint {
        fingerprint::fingerprint(
            &self.messages,
            &self.model,
            self.max_tokens.unwrap_or(defaults.default_max_tokens),
            self.temperature.unwrap_or(defaults.default_temperature),
        )
    }

    /// Body sent upstream: the client's fields with `model` replaced by `deployment`.
    pub fn upstream_body(&self, deployment: &str) -> Value {
        let mut body = self.extra.clone();
        body.insert("model".to_string(), Value::String(deployment.to_string()));
        body.insert("messages".to_string(), Value::Array(self.messages.clone()));
        if let Some(max_tokens) = self.max_tokens {
            body.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = self.temperature {
            body.insert("temperature".to_string(), Value::from(temperature));
        }
        if self.stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }

    pub(crate) fn validation_request() -> Self {
        Self {
            messages: vec![serde_json::json!({"role": "user", "content": "test"})],
            model: String::new(),
            max_tokens: Some(5),
            temperature: None,
            stream: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,
    #[error("{source}")]
    Upstream { source: ProxyError },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl GatewayError {
    /// Whether an upstream failure was the provider throttling us. Falls back to
    /// matching "429" or "rate limit" in the message when no status is known.
    pub fn is_upstream_rate_limit(&self) -> bool {
        let Self::Upstream { source } = self else {
            return false;
        };
        if let Some(status) = source.upstream_status() {
            return status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        }
        let message = source.to_string().to_ascii_lowercase();
        message.contains("429") || message.contains("rate limit")
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Completion {
    pub response: Value,
    pub cache: CacheStatus,
}

/// One outbound event of a streamed completion.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Chunk(Value),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Chunk(chunk) => encode_data_event(&chunk.to_string()),
            Self::Done => encode_data_event(DONE_SENTINEL),
            Self::Error(message) => {
                encode_data_event(&serde_json::json!({ "error": message }).to_string())
            }
        }
    }
}

pub enum GatewayReply {
    Completion(Completion),
    Stream(BoxStream<'static, StreamEvent>),
}

impl std::fmt::Debug for GatewayReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completion(completion) => f.debug_tuple("Completion").field(completion).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub struct Gateway {
    upstream: Arc<dyn Upstream>,
    limits: Mutex<RateLimiter>,
    cache: Mutex<ResponseCache>,
    fingerprint_defaults: CacheConfig,
    retry: RetryExecutor,
    observability: Observability,
    clock: Box<dyn Clock>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self::with_clock(config, upstream, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: &GatewayConfig,
        upstream: Arc<dyn Upstream>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            upstream,
            limits: Mutex::new(RateLimiter::new(config.limits.clone())),
            cache: Mutex::new(ResponseCache::new(config.cache.clone())),
            fingerprint_defaults: config.cache.clone(),
            retry: RetryExecutor::new(config.retry.clone()),
            observability: Observability::default(),
            clock,
        }
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Admits the request, then either serves a (possibly cached) completion or
    /// opens a stream. Streams are never cached or retried.
    pub async fn handle(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<GatewayReply, GatewayError> {
        self.observability.record_request();
        self.admit().await?;

        if request.stream {
            self.observability.record_stream();
            return Ok(GatewayReply::Stream(self.open_stream(request).await));
        }
        self.complete(request).await.map(GatewayReply::Completion)
    }

    async fn admit(&self) -> Result<(), GatewayError> {
        let now = self.clock.now_epoch_seconds();
        let admitted = self.limits.lock().await.admit(now);
        if !admitted {
            self.observability.record_rate_limited();
            tracing::debug!("request rejected by rate limiter");
            return Err(GatewayError::RateLimited);
        }
        Ok(())
    }

    async fn complete(&self, request: &ChatCompletionRequest) -> Result<Completion, GatewayError> {
        let key = request.fingerprint(&self.fingerprint_defaults);
        let now = self.clock.now_epoch_seconds();
        let cached = self.cache.lock().await.get(&key, now);

        if let Some(response) = cached {
            self.observability.record_cache_hit();
            tracing::debug!(fingerprint = %key, "serving cached completion");
            return Ok(Completion {
                response,
                cache: CacheStatus::Hit,
            });
        }
        self.observability.record_cache_miss();

        let upstream = &self.upstream;
        let result = self
            .retry
            .execute(|attempt| {
                self.observability.record_upstream_call();
                tracing::debug!(attempt, "calling upstream");
                upstream.complete(request)
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(source) => {
                self.observability.record_upstream_failure();
                tracing::error!(error = %source, "chat completion request failed");
                return Err(GatewayError::Upstream { source });
            }
        };

        self.cache
            .lock()
            .await
            .put(key, response.clone(), self.clock.now_epoch_seconds());
        Ok(Completion {
            response,
            cache: CacheStatus::Miss,
        })
    }

    async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> BoxStream<'static, StreamEvent> {
        self.observability.record_upstream_call();
        match self.upstream.stream(request).await {
            Ok(chunks) => stream_events(chunks),
            Err(err) => {
                self.observability.record_upstream_failure();
                tracing::error!(error = %err, "streaming response failed");
                stream::iter([StreamEvent::Error(err.to_string())]).boxed()
            }
        }
    }
}

fn has_choices(chunk: &Value) -> bool {
    chunk
        .get("choices")
        .and_then(Value::as_array)
        .is_some_and(|choices| !choices.is_empty())
}

/// Forwards chunks that carry choices, then `Done`. The first error becomes the
/// final event and no `Done` follows it.
fn stream_events(
    chunks: BoxStream<'static, crate::Result<Value>>,
) -> BoxStream<'static, StreamEvent> {
    stream::unfold(Some(chunks), |state| async move {
        let mut chunks = state?;
        loop {
            match chunks.next().await {
                Some(Ok(chunk)) if has_choices(&chunk) => {
                    return Some((StreamEvent::Chunk(chunk), Some(chunks)));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    tracing::error!(error = %err, "streaming response failed");
                    return Some((StreamEvent::Error(err.to_string()), None));
                }
                None => return Some((StreamEvent::Done, None)),
            }
        }
    })
    .boxed()
}
