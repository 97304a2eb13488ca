use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use futures_util::stream::BoxStream;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use aoai_proxy::gateway::observability::ObservabilitySnapshot;
use aoai_proxy::gateway::{
    ChatCompletionRequest, Gateway, GatewayConfig, GatewayHttpState, Upstream, UpstreamConfig,
    router,
};

struct UnusedUpstream;

#[async_trait]
impl Upstream for UnusedUpstream {
    async fn complete(&self, _request: &ChatCompletionRequest) -> aoai_proxy::Result<Value> {
        Ok(json!({"id": "chatcmpl-unused", "choices": []}))
    }

    async fn stream(
        &self,
        _request: &ChatCompletionRequest,
    ) -> aoai_proxy::Result<BoxStream<'static, aoai_proxy::Result<Value>>> {
        Ok(Box::pin(futures_util::stream::empty()))
    }
}

fn app() -> axum::Router {
    let config = GatewayConfig {
        upstream: UpstreamConfig {
            endpoint: "https://res.openai.azure.com".to_string(),
            deployment: "prod-4o-mini".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let gateway = Gateway::new(&config, Arc::new(UnusedUpstream));
    router(GatewayHttpState::new(gateway, &config.upstream))
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_service_name() {
    let (status, body) = get_json(&app(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy", "service": "azure-openai-proxy"}));
}

#[tokio::test]
async fn models_lists_the_deployment() {
    let (status, body) = get_json(&app(), "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "object": "list",
            "data": [{
                "id": "prod-4o-mini",
                "object": "model",
                "created": 1677610602,
                "owned_by": "azure-openai",
            }],
        })
    );
}

#[tokio::test]
async fn root_lists_endpoints() {
    let (status, body) = get_json(&app(), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "Azure OpenAI Proxy");
    assert_eq!(body["max_tokens"], 4000);
    let endpoints = body["endpoints"].as_array().cloned().unwrap_or_default();
    assert!(endpoints.iter().any(|entry| {
        entry
            .as_str()
            .is_some_and(|entry| entry.starts_with("/v1/chat/completions"))
    }));
}

#[tokio::test]
async fn metrics_start_at_zero() {
    let (status, body) = get_json(&app(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: ObservabilitySnapshot = serde_json::from_value(body).unwrap();
    assert_eq!(snapshot, ObservabilitySnapshot::default());
}

#[tokio::test]
async fn cors_preflight_is_allowed() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1/chat/completions")
        .header("origin", "https://app.example.com")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some("https://app.example.com")
    );
}
