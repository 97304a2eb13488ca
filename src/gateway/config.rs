use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CacheConfig, LimitsConfig, RetryConfig, UpstreamConfig};
use crate::auth::oauth::DEFAULT_AUTHORITY_HOST;
use crate::auth::{OAuthClientCredentials, StaticToken, TokenProvider};
use crate::env::Env;
use crate::{ProxyError, Result};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub upstream: UpstreamConfig,
    pub credentials: CredentialsConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Pre-issued bearer token. When set, the client-credentials grant is skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_token: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            static_token: None,
        }
    }
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field(
                "static_token",
                &self.static_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl CredentialsConfig {
    pub fn token_provider(&self) -> Result<Arc<dyn TokenProvider>> {
        if let Some(token) = self.static_token.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(Arc::new(StaticToken::new(token)));
        }
        let oauth = OAuthClientCredentials::for_tenant(
            &self.authority_host,
            &self.tenant_id,
            self.client_id.clone(),
            self.client_secret.clone(),
        )?;
        Ok(Arc::new(oauth))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "INFO".to_string(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| ProxyError::Config(format!("invalid toml: {err}")))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Overlays every recognised key present in `env`.
    pub fn apply_env(&mut self, env: &Env) -> Result<()> {
        let credentials = &mut self.credentials;
        set_string(env, "AZURE_AUTHORITY_HOST", &mut credentials.authority_host);
        set_string(env, "AZURE_TENANT_ID", &mut credentials.tenant_id);
        set_string(env, "AZURE_CLIENT_ID", &mut credentials.client_id);
        set_string(env, "AZURE_CLIENT_SECRET", &mut credentials.client_secret);
        if let Some(token) = env.get("AZURE_OPENAI_BEARER_TOKEN") {
            credentials.static_token = Some(token);
        }

        let upstream = &mut self.upstream;
        set_string(env, "AZURE_OPENAI_ENDPOINT", &mut upstream.endpoint);
        set_string(env, "AZURE_OPENAI_DEPLOYMENT", &mut upstream.deployment);
        set_string(env, "AZURE_OPENAI_API_VERSION", &mut upstream.api_version);
        set_parsed(env, "AZURE_OPENAI_MAX_TOKENS", &mut upstream.max_tokens)?;
        set_parsed(env, "REQUEST_TIMEOUT", &mut upstream.request_timeout_seconds)?;

        let server = &mut self.server;
        set_string(env, "HOST", &mut server.host);
        set_parsed(env, "PORT", &mut server.port)?;
        set_string(env, "LOG_LEVEL", &mut server.log_level);
        if let Some(raw) = env.get("JSON_LOGS") {
            server.json_logs = parse_bool("JSON_LOGS", &raw)?;
        }

        set_parsed(env, "RATE_LIMIT_MAX_REQUESTS", &mut self.limits.max_requests)?;
        set_parsed(env, "RATE_LIMIT_WINDOW_SECONDS", &mut self.limits.window_seconds)?;

        let cache = &mut self.cache;
        set_parsed(env, "CACHE_TTL_SECONDS", &mut cache.ttl_seconds)?;
        if let Some(raw) = env.get("CACHE_MAX_ENTRIES") {
            cache.max_entries = Some(parse_value("CACHE_MAX_ENTRIES", &raw)?);
        }
        set_parsed(env, "CACHE_DEFAULT_MAX_TOKENS", &mut cache.default_max_tokens)?;
        set_parsed(env, "AZURE_OPENAI_TEMPERATURE", &mut cache.default_temperature)?;

        let retry = &mut self.retry;
        set_parsed(env, "RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        set_parsed(env, "RETRY_MIN_BACKOFF_SECONDS", &mut retry.min_backoff_seconds)?;
        set_parsed(env, "RETRY_MAX_BACKOFF_SECONDS", &mut retry.max_backoff_seconds)?;
        if let Some(raw) = env.get("RETRY_STATUS_CODES") {
            retry.retry_status_codes = Some(parse_status_codes(&raw)?);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.endpoint.trim().is_empty() {
            return Err(ProxyError::Config(
                "AZURE_OPENAI_ENDPOINT is required".to_string(),
            ));
        }
        if reqwest::Url::parse(self.upstream.endpoint.trim()).is_err() {
            return Err(ProxyError::Config(format!(
                "AZURE_OPENAI_ENDPOINT is not a valid url: {}",
                self.upstream.endpoint
            )));
        }
        if self.upstream.deployment.trim().is_empty() {
            return Err(ProxyError::Config(
                "AZURE_OPENAI_DEPLOYMENT is required".to_string(),
            ));
        }

        let credentials = &self.credentials;
        let has_static = credentials
            .static_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty());
        if !has_static {
            for (key, value) in [
                ("AZURE_TENANT_ID", &credentials.tenant_id),
                ("AZURE_CLIENT_ID", &credentials.client_id),
                ("AZURE_CLIENT_SECRET", &credentials.client_secret),
            ] {
                if value.trim().is_empty() {
                    return Err(ProxyError::Config(format!("{key} is required")));
                }
            }
        }

        if self.retry.min_backoff_seconds > self.retry.max_backoff_seconds {
            return Err(ProxyError::Config(format!(
                "RETRY_MIN_BACKOFF_SECONDS ({}) exceeds RETRY_MAX_BACKOFF_SECONDS ({})",
                self.retry.min_backoff_seconds, self.retry.max_backoff_seconds
            )));
        }
        if self.limits.window_seconds == 0 {
            return Err(ProxyError::Config(
                "RATE_LIMIT_WINDOW_SECONDS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn set_string(env: &Env, key: &str, slot: &mut String) {
    if let Some(value) = env.get(key) {
        *slot = value.trim().to_string();
    }
}

fn set_parsed<T: FromStr>(env: &Env, key: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = env.get(key) {
        *slot = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ProxyError::Config(format!("{key}: invalid value {raw:?}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ProxyError::Config(format!("{key}: invalid value {raw:?}"))),
    }
}

/// Comma-separated HTTP statuses, e.g. `429,500,502`.
fn parse_status_codes(raw: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let code: u16 = parse_value("RETRY_STATUS_CODES", part)?;
        if !(100..=599).contains(&code) {
            return Err(ProxyError::Config(format!(
                "RETRY_STATUS_CODES: {code} is not an http status"
            )));
        }
        out.push(code);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_env() -> Env {
        Env::isolated(
            "AZURE_TENANT_ID=tenant\nAZURE_CLIENT_ID=client\nAZURE_CLIENT_SECRET=secret\n\
             AZURE_OPENAI_ENDPOINT=https://res.openai.azure.com\n",
        )
    }

    #[test]
    fn defaults_match_reference_settings() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.upstream.api_version, "2024-02-01");
        assert_eq!(config.upstream.request_timeout_seconds, 60);
        assert_eq!(config.limits.max_requests, 50);
        assert_eq!(config.cache.ttl_seconds, 300);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn toml_sections_override_defaults() -> Result<()> {
        let config = GatewayConfig::from_toml_str(
            r#"
[upstream]
endpoint = "https://res.openai.azure.com"
deployment = "prod"

[limits]
max_requests = 5

[cache]
max_entries = 100
"#,
        )?;
        assert_eq!(config.upstream.deployment, "prod");
        assert_eq!(config.upstream.api_version, "2024-02-01");
        assert_eq!(config.limits.max_requests, 5);
        assert_eq!(config.limits.window_seconds, 60);
        assert_eq!(config.cache.max_entries, Some(100));
        Ok(())
    }

    #[test]
    fn env_overlays_every_section() -> Result<()> {
        let mut config = GatewayConfig::default();
        config.apply_env(&Env::isolated(
            "PORT=9001\nJSON_LOGS=true\nRATE_LIMIT_MAX_REQUESTS=7\nCACHE_TTL_SECONDS=30\n\
             AZURE_OPENAI_TEMPERATURE=0.2\nRETRY_STATUS_CODES=429, 503\nREQUEST_TIMEOUT=15\n",
        ))?;
        assert_eq!(config.server.port, 9001);
        assert!(config.server.json_logs);
        assert_eq!(config.limits.max_requests, 7);
        assert_eq!(config.cache.ttl_seconds, 30);
        assert_eq!(config.cache.default_temperature, 0.2);
        assert_eq!(config.retry.retry_status_codes, Some(vec![429, 503]));
        assert_eq!(config.upstream.request_timeout_seconds, 15);
        Ok(())
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_env(&Env::isolated("PORT=eighty\n"))
            .err()
            .map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("invalid config: PORT: invalid value \"eighty\"")
        );
        assert!(parse_status_codes("429,700").is_err());
    }

    #[test]
    fn validate_requires_endpoint_and_credentials() -> Result<()> {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err());

        config.apply_env(&complete_env())?;
        config.validate()?;

        config.credentials.client_secret.clear();
        let err = config.validate().err().map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("invalid config: AZURE_CLIENT_SECRET is required")
        );

        config.credentials.static_token = Some("pre-issued".to_string());
        config.validate()?;
        Ok(())
    }

    #[test]
    fn debug_redacts_secrets() -> Result<()> {
        let mut config = GatewayConfig::default();
        config.apply_env(&complete_env())?;
        let rendered = format!("{config:?}");
        assert!(rendered.contains("tenant"));
        assert!(!rendered.contains("secret\""));
        Ok(())
    }
}
