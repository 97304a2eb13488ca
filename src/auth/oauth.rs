use async_trait::async_trait;
use serde::Deserialize;

use super::TokenProvider;
use crate::{ProxyError, Result};

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

#[derive(Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl OAuthToken {
    pub fn authorization_header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// OAuth2 client-credentials grant against an Entra ID (Azure AD) tenant.
#[derive(Clone)]
pub struct OAuthClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for OAuthClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

impl OAuthClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let token_url = token_url.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        if token_url.trim().is_empty() {
            return Err(ProxyError::Config("oauth token_url is required".to_string()));
        }
        if client_id.trim().is_empty() {
            return Err(ProxyError::Config("oauth client_id is required".to_string()));
        }
        if client_secret.trim().is_empty() {
            return Err(ProxyError::Config(
                "oauth client_secret is required".to_string(),
            ));
        }

        Ok(Self {
            token_url,
            client_id,
            client_secret,
            scope: COGNITIVE_SERVICES_SCOPE.to_string(),
            http: reqwest::Client::new(),
        })
    }

    /// Token endpoint of `tenant_id` under `authority_host`
    /// (`{authority}/{tenant}/oauth2/v2.0/token`).
    pub fn for_tenant(
        authority_host: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(ProxyError::Config("oauth tenant_id is required".to_string()));
        }
        let token_url = crate::utils::http::join_url(
            authority_host,
            &format!("{tenant_id}/oauth2/v2.0/token"),
        );
        Self::new(token_url, client_id, client_secret)
    }

    pub async fn fetch_token(&self) -> Result<OAuthToken> {
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if !self.scope.trim().is_empty() {
            params.push(("scope", self.scope.as_str()));
        }

        let parsed = crate::utils::http::send_checked_json::<TokenResponse>(
            self.http.post(self.token_url.as_str()).form(&params),
        )
        .await?;
        let access_token = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                ProxyError::InvalidResponse("oauth response missing access_token".to_string())
            })?;
        let token_type = parsed
            .token_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Bearer".to_string());

        Ok(OAuthToken {
            access_token,
            token_type,
            expires_in: parsed.expires_in,
        })
    }
}

#[async_trait]
impl TokenProvider for OAuthClientCredentials {
    async fn authorization(&self) -> Result<String> {
        let token = self.fetch_token().await?;
        tracing::debug!(expires_in = ?token.expires_in, "acquired upstream bearer token");
        Ok(token.authorization_header_value())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}
