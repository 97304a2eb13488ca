use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChatCompletionRequest;
use crate::auth::TokenProvider;
use crate::utils::http::{join_url, send_checked, send_checked_json};
use crate::utils::sse::sse_data_stream_from_response;
use crate::{ProxyError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    /// Whole-call limit for non-streaming calls; for streams it bounds the
    /// wait for response headers.
    pub request_timeout_seconds: u64,
    /// Deployment output ceiling. Reported in service metadata, not enforced.
    pub max_tokens: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            deployment: "gpt-4o-mini".to_string(),
            api_version: "2024-02-01".to_string(),
            request_timeout_seconds: 60,
            max_tokens: 4000,
        }
    }
}

/// One outbound chat-completion call to the provider.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<Value>;

    /// Opens a streaming completion. Each item is one parsed `data:` chunk;
    /// the stream ends when the provider sends its terminal sentinel.
    async fn stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BoxStream<'static, Result<Value>>>;

    /// Startup self-check: a five-token completion against the deployment.
    async fn validate(&self) -> Result<()> {
        let request = ChatCompletionRequest::validation_request();
        self.complete(&request).await.map(|_| ())
    }
}

pub struct AzureOpenAiUpstream {
    http: reqwest::Client,
    config: UpstreamConfig,
    auth: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for AzureOpenAiUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAiUpstream")
            .field("endpoint", &self.config.endpoint)
            .field("deployment", &self.config.deployment)
            .field("api_version", &self.config.api_version)
            .finish_non_exhaustive()
    }
}

impl AzureOpenAiUpstream {
    pub fn new(config: UpstreamConfig, auth: Arc<dyn TokenProvider>) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(ProxyError::Config(
                "upstream endpoint is required".to_string(),
            ));
        }
        if config.deployment.trim().is_empty() {
            return Err(ProxyError::Config(
                "upstream deployment is required".to_string(),
            ));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            config,
            auth,
        })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_seconds.max(1))
    }

    pub fn completions_url(&self) -> String {
        join_url(
            &self.config.endpoint,
            &format!(
                "openai/deployments/{}/chat/completions",
                self.config.deployment.trim()
            ),
        )
    }

    async fn post(&self, request: &ChatCompletionRequest) -> Result<reqwest::RequestBuilder> {
        let authorization = self.auth.authorization().await?;
        let body = request.upstream_body(&self.config.deployment);
        Ok(self
            .http
            .post(self.completions_url())
            .query(&[("api-version", self.config.api_version.as_str())])
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&body))
    }
}

#[async_trait]
impl Upstream for AzureOpenAiUpstream {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<Value> {
        let req = self
            .post(request)
            .await?
            .timeout(self.request_timeout());
        send_checked_json::<Value>(req).await
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        // Bounds the wait for response headers only; the body may stream for longer.
        let timeout = self.request_timeout();
        let response = tokio::time::timeout(timeout, send_checked(self.post(request).await?))
            .await
            .map_err(|_| ProxyError::Timeout(timeout))??;
        let chunks = sse_data_stream_from_response(response).map(|item| {
            let data = item?;
            serde_json::from_str::<Value>(&data).map_err(ProxyError::from)
        });
        Ok(chunks.boxed())
    }
}
