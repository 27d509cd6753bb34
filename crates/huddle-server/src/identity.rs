//! Handle to DID resolution.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Handle resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The lookup request failed.
    #[error("handle lookup failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Resolves a handle to the DID it is bound to.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    /// Resolve `handle`, returning `None` when it is not bound to a DID.
    async fn resolve(&self, handle: &str) -> Result<Option<String>, ResolveError>;
}

/// Resolver using the `https://<handle>/.well-known/atproto-did` lookup.
pub struct HttpsHandleResolver {
    client: reqwest::Client,
}

impl HttpsHandleResolver {
    /// Create a resolver with a short request timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .user_agent(concat!("huddle/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpsHandleResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandleResolver for HttpsHandleResolver {
    async fn resolve(&self, handle: &str) -> Result<Option<String>, ResolveError> {
        let handle = handle.trim().to_ascii_lowercase();
        if !is_valid_handle(&handle) {
            debug!(handle = %handle, "Not a valid handle");
            return Ok(None);
        }

        let url = format!("https://{handle}/.well-known/atproto-did");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            debug!(handle = %handle, status = %response.status(), "Handle lookup not found");
            return Ok(None);
        }

        let body = response.text().await?;
        Ok(parse_did(&body))
    }
}

/// Take the DID from a well-known response body.
fn parse_did(body: &str) -> Option<String> {
    body.lines()
        .next()
        .map(str::trim)
        .filter(|line| line.starts_with("did:"))
        .map(str::to_string)
}

/// A handle is a DNS name with at least two labels.
fn is_valid_handle(handle: &str) -> bool {
    if handle.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = handle.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
