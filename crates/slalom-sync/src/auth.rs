//! # Authentication Collaborator
//!
//! Supplies the bearer token attached to every sync request. Token
//! acquisition (PIN login, refresh) happens outside the engine; the engine
//! only reads the current token and invalidates it when the server reports
//! it expired.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current bearer token. `Ok(None)` sends the request unauthenticated.
    async fn authorization(&self) -> SyncResult<Option<String>>;

    /// Drops the current token after a 401 with `expired: true`.
    async fn invalidate(&self);
}

/// Sends requests without an Authorization header.
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn authorization(&self) -> SyncResult<Option<String>> {
        Ok(None)
    }

    async fn invalidate(&self) {}
}

/// A bearer token with an optional local expiry.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub expires_at: Option<Instant>,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining_secs(&self) -> Option<u64> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs())
    }
}

/// Holds a token set by the embedder.
#[derive(Default)]
pub struct TokenAuth {
    token: RwLock<Option<TokenInfo>>,
}

impl TokenAuth {
    /// A token without local expiry. The server still decides.
    pub fn new(access_token: impl Into<String>) -> Self {
        TokenAuth {
            token: RwLock::new(Some(TokenInfo {
                access_token: access_token.into(),
                expires_at: None,
            })),
        }
    }

    pub fn with_ttl(access_token: impl Into<String>, ttl: Duration) -> Self {
        TokenAuth {
            token: RwLock::new(Some(TokenInfo {
                access_token: access_token.into(),
                expires_at: Some(Instant::now() + ttl),
            })),
        }
    }

    /// Replaces the token, e.g. after re-authentication.
    pub async fn set_token(&self, token: TokenInfo) {
        debug!(remaining_secs = ?token.remaining_secs(), "Auth token updated");
        *self.token.write().await = Some(token);
    }

    pub async fn current_token(&self) -> Option<TokenInfo> {
        self.token.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .await
            .as_ref()
            .is_some_and(|token| !token.is_expired())
    }
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn authorization(&self) -> SyncResult<Option<String>> {
        match self.token.read().await.as_ref() {
            Some(token) if token.is_expired() => Err(SyncError::AuthExpired),
            Some(token) => Ok(Some(token.access_token.clone())),
            None => Err(SyncError::AuthExpired),
        }
    }

    async fn invalidate(&self) {
        if self.token.write().await.take().is_some() {
            info!("Auth token invalidated, re-authentication required");
        }
    }
}
