//! OpenAI-compatible chat-completion proxy for Azure OpenAI deployments.
//!
//! Requests pass through a fixed-window rate limiter and a fingerprint-keyed
//! response cache before reaching the upstream behind a bounded retry.

pub mod auth;
pub mod env;
mod error;
pub mod gateway;
pub mod utils;

pub use env::Env;
pub use error::{ProxyError, Result};
