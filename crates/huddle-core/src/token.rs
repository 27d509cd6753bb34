//! Short-lived upgrade tokens.
//!
//! A token is minted for an authenticated identity over HTTP and presented
//! once when that identity opens its router connection. Tokens are only
//! checked, not consumed; they stop working when their TTL runs out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use huddle_protocol::Identity;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30);

/// Number of random bytes in a token.
const TOKEN_BYTES: usize = 32;

/// Token validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// No token was presented.
    #[error("Missing authorization token")]
    Missing,

    /// The token is unknown or has expired.
    #[error("Token invalid or expired")]
    Invalid,

    /// The token was issued for a different identity.
    #[error("Token was not issued for {0}")]
    IdentityMismatch(Identity),
}

#[derive(Debug)]
struct TokenEntry {
    identity: Identity,
    expires_at: Instant,
}

/// Generate a random, URL-safe token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Store of outstanding upgrade tokens.
#[derive(Debug)]
pub struct TokenStore {
    entries: DashMap<String, TokenEntry>,
    ttl: Duration,
    unsafe_dev_token: Option<String>,
}

impl TokenStore {
    /// Create a store whose tokens live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            unsafe_dev_token: None,
        }
    }

    /// Accept `token` for any identity.
    ///
    /// Development only: anyone holding this token can connect as anyone.
    #[must_use]
    pub fn with_unsafe_dev_token(mut self, token: impl Into<String>) -> Self {
        warn!("Unsafe development token enabled; any identity can connect with it");
        self.unsafe_dev_token = Some(token.into());
        self
    }

    /// Token lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token for `identity`.
    pub fn issue(&self, identity: impl Into<Identity>) -> String {
        let token = generate_token();
        let identity = identity.into();
        debug!(identity = %identity, ttl_secs = self.ttl.as_secs(), "Issued upgrade token");

        self.entries.insert(
            token.clone(),
            TokenEntry {
                identity,
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Check that `token` authorizes a connection as `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is missing, unknown, expired or bound to
    /// another identity.
    pub fn validate(&self, token: Option<&str>, identity: &str) -> Result<(), TokenError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(TokenError::Missing)?;

        if self.unsafe_dev_token.as_deref() == Some(token) {
            debug!(identity = %identity, "Accepted unsafe development token");
            return Ok(());
        }

        let entry = self.entries.get(token).ok_or(TokenError::Invalid)?;
        if entry.expires_at <= Instant::now() {
            return Err(TokenError::Invalid);
        }
        if entry.identity != identity {
            return Err(TokenError::IdentityMismatch(identity.to_string()));
        }

        Ok(())
    }

    /// Remove expired tokens, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged, "Purged expired tokens");
        }
        purged
    }

    /// Spawn a task that purges expired tokens every `period`.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                store.purge_expired();
            }
        })
    }

    /// Number of stored tokens, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}
