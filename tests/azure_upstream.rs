use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::{Method::POST, MockServer};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use aoai_proxy::Env;
use aoai_proxy::gateway::{
    AzureOpenAiUpstream, Gateway, GatewayConfig, GatewayHttpState, Upstream, router,
};
use aoai_proxy::utils::test_support::should_skip_httpmock;

fn config_for(server: &MockServer) -> aoai_proxy::Result<GatewayConfig> {
    let mut config = GatewayConfig::default();
    config.apply_env(&Env::isolated(&format!(
        "AZURE_AUTHORITY_HOST={base}\nAZURE_TENANT_ID=tenant-1\nAZURE_CLIENT_ID=client\n\
         AZURE_CLIENT_SECRET=secret\nAZURE_OPENAI_ENDPOINT={base}\n\
         AZURE_OPENAI_DEPLOYMENT=prod-4o\n",
        base = server.base_url()
    )))?;
    config.validate()?;
    Ok(config)
}

fn upstream(config: &GatewayConfig) -> aoai_proxy::Result<AzureOpenAiUpstream> {
    AzureOpenAiUpstream::new(
        config.upstream.clone(),
        config.credentials.token_provider()?,
    )
}

fn app(config: &GatewayConfig) -> aoai_proxy::Result<axum::Router> {
    let upstream = upstream(config)?;
    let gateway = Gateway::new(config, Arc::new(upstream));
    Ok(router(GatewayHttpState::new(gateway, &config.upstream)))
}

fn chat(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn completion_fetches_token_per_call_and_caches() -> aoai_proxy::Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/tenant-1/oauth2/v2.0/token")
                .body_includes("grant_type=client_credentials");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"aad-token","token_type":"Bearer","expires_in":3599}"#);
        })
        .await;
    let completion = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/openai/deployments/prod-4o/chat/completions")
                .query_param("api-version", "2024-02-01")
                .header("authorization", "Bearer aad-token")
                .body_includes(r#""model":"prod-4o""#);
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    json!({
                        "id": "chatcmpl-az",
                        "object": "chat.completion",
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": "hello"},
                        }],
                    })
                    .to_string(),
                );
        })
        .await;

    let app = app(&config_for(&server)?)?;
    let body = json!({"messages": [{"role": "user", "content": "hi"}], "model": "gpt-4o-mini"});

    let first = app.clone().oneshot(chat(body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first = to_bytes(first.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&first)?;
    assert_eq!(parsed["choices"][0]["message"]["content"], "hello");

    let second = app.clone().oneshot(chat(body)).await.unwrap();
    let second = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(first, second);

    token.assert_calls_async(1).await;
    completion.assert_calls_async(1).await;

    let distinct = app
        .clone()
        .oneshot(chat(json!({"messages": [{"role": "user", "content": "again"}]})))
        .await
        .unwrap();
    assert_eq!(distinct.status(), StatusCode::OK);
    token.assert_calls_async(2).await;
    Ok(())
}

#[tokio::test]
async fn streaming_relays_azure_events() -> aoai_proxy::Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/tenant-1/oauth2/v2.0/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"aad-token"}"#);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/openai/deployments/prod-4o/chat/completions")
                .body_includes(r#""stream":true"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"choices\":[],\"prompt_filter_results\":[]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\n",
                    "data: [DONE]\n\n",
                ));
        })
        .await;

    let app = app(&config_for(&server)?)?;
    let response = app
        .oneshot(chat(json!({"messages": [{"role": "user", "content": "hi"}], "stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8_lossy(&body);
    let events: Vec<&str> = body.split_terminator("\n\n").collect();

    assert_eq!(events.len(), 3);
    let contents: Vec<Value> = events[..2]
        .iter()
        .map(|event| {
            let chunk: Value = serde_json::from_str(event.trim_start_matches("data: ")).unwrap();
            chunk["choices"][0]["delta"]["content"].clone()
        })
        .collect();
    assert_eq!(contents, vec![json!("he"), json!("llo")]);
    assert_eq!(events[2], "data: [DONE]");
    Ok(())
}

#[tokio::test]
async fn startup_check_surfaces_auth_failure() -> aoai_proxy::Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/tenant-1/oauth2/v2.0/token");
            then.status(401).body(r#"{"error":"invalid_client"}"#);
        })
        .await;

    let config = config_for(&server)?;
    let err = upstream(&config)?.validate().await.err();
    let status = err.as_ref().and_then(aoai_proxy::ProxyError::upstream_status);
    assert_eq!(status.map(|status| status.as_u16()), Some(401));
    Ok(())
}
