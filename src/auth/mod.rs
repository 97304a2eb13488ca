//! Upstream credentials.

pub mod oauth;

use async_trait::async_trait;

pub use oauth::{OAuthClientCredentials, OAuthToken};

use crate::Result;

/// Supplies the `Authorization` header value for an upstream call.
///
/// Called once per upstream request; implementations decide whether to cache.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn authorization(&self) -> Result<String>;
}

/// A pre-issued bearer token.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn authorization(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.token.trim()))
    }
}
