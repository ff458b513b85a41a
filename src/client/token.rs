//! Token providers
//!
//! The connection manager never stores credentials of its own; it asks a
//! provider whenever it needs a token (first connect without an explicit
//! token, every scheduled reconnect, and after the server rejects a token).

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

/// Source of authentication tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a current token, or `None` if the user is not signed in
    async fn token(&self) -> Option<String>;
}

/// Always returns the same token
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        non_empty(self.0.clone())
    }
}

/// Re-reads a token file on every request, so rotated tokens are picked up
#[derive(Debug, Clone)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenProvider for FileToken {
    async fn token(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => non_empty(content.trim().to_string()),
            Err(e) => {
                warn!("Failed to read token file {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// Adapts an async closure into a provider
pub struct TokenFn<F>(F);

/// Build a provider from a closure returning a future
pub fn token_fn<F, Fut>(f: F) -> TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    TokenFn(f)
}

#[async_trait]
impl<F, Fut> TokenProvider for TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    async fn token(&self) -> Option<String> {
        (self.0)().await.and_then(non_empty)
    }
}

fn non_empty(token: String) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
