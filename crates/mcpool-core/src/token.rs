//! Authorization tokens and the external token store interface.
//!
//! Tokens are persisted keyed by (principal, server). The store itself is an
//! external collaborator; implementations must be concurrency-safe.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Client registration info bound to a token set (from dynamic client
/// registration or static configuration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
}

/// An access/refresh token pair for one (principal, server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub scope: Option<String>,
    /// Bound client registration, when the flow performed one.
    pub client_info: Option<ClientRegistration>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl AuthTokens {
    /// Create a bearer token set with no refresh token or expiry.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            token_type: default_token_type(),
            scope: None,
            client_info: None,
        }
    }

    pub fn with_refresh(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expired or about to expire (5 minute buffer).
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - ChronoDuration::seconds(300) < Utc::now(),
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Persistent token storage keyed by (principal, server).
///
/// `create_token` writes a fresh token set from a completed authorization
/// flow (including any bound `client_info`); `update_token` overwrites after
/// a refresh exchange.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find_token(&self, principal: &str, server: &str)
        -> anyhow::Result<Option<AuthTokens>>;

    async fn create_token(
        &self,
        principal: &str,
        server: &str,
        tokens: AuthTokens,
    ) -> anyhow::Result<()>;

    async fn update_token(
        &self,
        principal: &str,
        server: &str,
        tokens: AuthTokens,
    ) -> anyhow::Result<()>;
}

/// In-memory token store for tests and simple embeddings.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: dashmap::DashMap<(String, String), AuthTokens>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn find_token(
        &self,
        principal: &str,
        server: &str,
    ) -> anyhow::Result<Option<AuthTokens>> {
        Ok(self
            .tokens
            .get(&(principal.to_string(), server.to_string()))
            .map(|t| t.clone()))
    }

    async fn create_token(
        &self,
        principal: &str,
        server: &str,
        tokens: AuthTokens,
    ) -> anyhow::Result<()> {
        self.tokens
            .insert((principal.to_string(), server.to_string()), tokens);
        Ok(())
    }

    async fn update_token(
        &self,
        principal: &str,
        server: &str,
        tokens: AuthTokens,
    ) -> anyhow::Result<()> {
        self.tokens
            .insert((principal.to_string(), server.to_string()), tokens);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_defaults() {
        let tokens = AuthTokens::bearer("abc");
        assert_eq!(tokens.token_type, "Bearer");
        assert!(!tokens.is_expired());
        assert!(!tokens.can_refresh());
    }

    #[test]
    fn test_expiry_buffer() {
        // Expires in two minutes: inside the five minute buffer.
        let soon = AuthTokens::bearer("abc").with_expiry(Utc::now() + ChronoDuration::minutes(2));
        assert!(soon.is_expired());

        let later = AuthTokens::bearer("abc").with_expiry(Utc::now() + ChronoDuration::hours(1));
        assert!(!later.is_expired());
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryTokenStore::new();
        assert!(store.find_token("u1", "gh").await.unwrap().is_none());

        store
            .create_token("u1", "gh", AuthTokens::bearer("t1").with_refresh("r1"))
            .await
            .unwrap();
        let found = store.find_token("u1", "gh").await.unwrap().unwrap();
        assert_eq!(found.access_token, "t1");

        store
            .update_token("u1", "gh", AuthTokens::bearer("t2"))
            .await
            .unwrap();
        let found = store.find_token("u1", "gh").await.unwrap().unwrap();
        assert_eq!(found.access_token, "t2");

        // Keyed per principal.
        assert!(store.find_token("u2", "gh").await.unwrap().is_none());
    }
}
