//! Authorization coordinator.
//!
//! Mediates interactive authorization for (principal, server) pairs.
//! Concurrent demands on the same pair collapse onto one flow: the flow id
//! is derived deterministically, initiation is guarded by an active-flow
//! map, and late arrivals attach to the pending flow in the store. Tokens
//! from a completed flow are persisted and pushed into the connection;
//! the connection is notified through its event channel, never by direct
//! calls into its state machine.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use mcpool_core::{
    AuthTokens, ConnectionEvent, FlowStatus, FlowStore, OAuthConfig, ServerConfig, TokenStore,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::Connection;

pub const FLOW_KIND_OAUTH: &str = "mcp_oauth";
pub const FLOW_KIND_GET_TOKENS: &str = "mcp_get_tokens";
pub const FLOW_KIND_REFRESH: &str = "mcp_refresh";

/// Hook handed the authorization url when a flow starts. Without one, the
/// url is logged prominently.
pub type OAuthStartHook = Arc<dyn Fn(String) + Send + Sync>;

/// Deterministic flow id for a (principal, server) pair.
pub fn flow_id(principal: &str, server: &str) -> String {
    format!("{principal}:{server}")
}

pub struct OAuthCoordinator {
    flow_store: Arc<dyn FlowStore>,
    token_store: Arc<dyn TokenStore>,
    http: reqwest::Client,
    oauth_start: parking_lot::RwLock<Option<OAuthStartHook>>,
    /// Flows this process is currently initiating; duplicate triggers attach
    /// instead of issuing a second authorization url.
    active: DashMap<String, ()>,
}

impl OAuthCoordinator {
    pub fn new(flow_store: Arc<dyn FlowStore>, token_store: Arc<dyn TokenStore>) -> Self {
        Self {
            flow_store,
            token_store,
            http: reqwest::Client::new(),
            oauth_start: parking_lot::RwLock::new(None),
            active: DashMap::new(),
        }
    }

    pub fn set_oauth_start(&self, hook: OAuthStartHook) {
        *self.oauth_start.write() = Some(hook);
    }

    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        self.token_store.clone()
    }

    /// Subscribe this coordinator to a connection's `OAuthRequired` events.
    pub fn attach(self: &Arc<Self>, conn: &Arc<Connection>) {
        let mut rx = conn.subscribe();
        let coordinator = self.clone();
        let weak = Arc::downgrade(conn);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConnectionEvent::OAuthRequired { server_url, .. }) => {
                        let Some(conn) = weak.upgrade() else { break };
                        coordinator.handle_oauth_required(&conn, server_url).await;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Resolve an authorization demand for this connection, then post the
    /// outcome back onto its event channel.
    pub async fn handle_oauth_required(&self, conn: &Arc<Connection>, server_url: Option<String>) {
        let principal = conn.principal().to_string();
        let server = conn.server().to_string();

        match self
            .obtain_tokens(&principal, &server, conn.config(), server_url)
            .await
        {
            Ok((tokens, initiated)) => {
                // Only the flow's initiator writes the store; attached
                // callers share the same outcome.
                if initiated {
                    if let Err(e) = self.persist_tokens(&principal, &server, &tokens).await {
                        warn!(server = %server, principal = %principal, error = %e, "failed to persist tokens");
                        conn.notify_oauth_failed(e.to_string());
                        return;
                    }
                }
                conn.set_auth_tokens(tokens);
                conn.notify_oauth_handled();
            }
            Err(e) => {
                warn!(server = %server, principal = %principal, error = %e, "authorization flow failed");
                conn.notify_oauth_failed(e.to_string());
            }
        }
    }

    /// Returns the tokens plus whether this caller initiated the flow (as
    /// opposed to attaching to one already in flight).
    async fn obtain_tokens(
        &self,
        principal: &str,
        server: &str,
        config: &ServerConfig,
        server_url: Option<String>,
    ) -> anyhow::Result<(AuthTokens, bool)> {
        let id = flow_id(principal, server);

        // A flow already pending in the store, or being initiated by this
        // process: attach and share its outcome.
        let pending_in_store = matches!(
            self.flow_store.get_flow_state(&id, FLOW_KIND_OAUTH).await?,
            Some(state) if state.status == FlowStatus::Pending
        );
        if pending_in_store || self.active.insert(id.clone(), ()).is_some() {
            debug!(flow = %id, "attaching to in-flight authorization");
            let value = self.flow_store.create_flow(&id, FLOW_KIND_OAUTH, None).await?;
            return Ok((parse_tokens(value)?, false));
        }
        // Initiator owns the active-flow marker until the flow resolves.
        let _guard = ActiveFlowGuard {
            active: &self.active,
            id: id.clone(),
        };

        let (auth_url, metadata) =
            build_authorization_url(config.oauth.as_ref(), server_url.as_deref(), principal, server)?;

        match self.oauth_start.read().clone() {
            Some(hook) => hook(auth_url),
            None => info!(
                server = %server,
                principal = %principal,
                "authorization required, open this url to continue: {auth_url}"
            ),
        }

        let value = self
            .flow_store
            .create_flow(&id, FLOW_KIND_OAUTH, Some(metadata))
            .await?;
        Ok((parse_tokens(value)?, true))
    }

    async fn persist_tokens(
        &self,
        principal: &str,
        server: &str,
        tokens: &AuthTokens,
    ) -> anyhow::Result<()> {
        let existing = self.token_store.find_token(principal, server).await?;
        match existing {
            None => {
                self.token_store
                    .create_token(principal, server, tokens.clone())
                    .await
            }
            Some(_) => {
                self.token_store
                    .update_token(principal, server, tokens.clone())
                    .await
            }
        }
    }

    /// Load persisted tokens for a (principal, server) pair, refreshing
    /// stale ones. Loads are serialized through the flow store so
    /// concurrent scoped-connection builds for the same pair read once.
    ///
    /// Returns `None` when no usable tokens exist; the connect path then
    /// runs the interactive flow on the resulting 401.
    pub async fn load_tokens(
        &self,
        principal: &str,
        server: &str,
        config: &ServerConfig,
    ) -> Option<AuthTokens> {
        let id = flow_id(principal, server);
        let token_store = self.token_store.clone();
        let principal_owned = principal.to_string();
        let server_owned = server.to_string();

        let loaded = self
            .flow_store
            .create_flow_with_handler(
                &id,
                FLOW_KIND_GET_TOKENS,
                Box::new(move || {
                    Box::pin(async move {
                        let tokens = token_store
                            .find_token(&principal_owned, &server_owned)
                            .await?;
                        serde_json::to_value(tokens).context("serialize loaded tokens")
                    })
                }),
            )
            .await;

        let tokens = match loaded {
            Ok(value) => serde_json::from_value::<Option<AuthTokens>>(value).ok()?,
            Err(e) => {
                debug!(server = %server, principal = %principal, error = %e, "token load failed");
                return None;
            }
        }?;

        if !tokens.is_expired() {
            return Some(tokens);
        }
        if !tokens.can_refresh() {
            debug!(server = %server, principal = %principal, "tokens expired with no refresh token");
            return None;
        }

        match self.refresh_tokens(principal, server, config, tokens).await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                warn!(server = %server, principal = %principal, error = %e, "token refresh failed");
                None
            }
        }
    }

    /// Out-of-band refresh exchange, serialized per (principal, server) via
    /// the flow-id mechanism and written back through `update_token`.
    pub async fn refresh_tokens(
        &self,
        principal: &str,
        server: &str,
        config: &ServerConfig,
        stale: AuthTokens,
    ) -> anyhow::Result<AuthTokens> {
        let id = flow_id(principal, server);
        let http = self.http.clone();
        let token_store = self.token_store.clone();
        let oauth = config.oauth.clone();
        let principal_owned = principal.to_string();
        let server_owned = server.to_string();

        let value = self
            .flow_store
            .create_flow_with_handler(
                &id,
                FLOW_KIND_REFRESH,
                Box::new(move || {
                    Box::pin(async move {
                        let fresh = refresh_exchange(&http, oauth.as_ref(), &stale).await?;
                        token_store
                            .update_token(&principal_owned, &server_owned, fresh.clone())
                            .await?;
                        serde_json::to_value(fresh).context("serialize refreshed tokens")
                    })
                }),
            )
            .await?;
        parse_tokens(value)
    }
}

struct ActiveFlowGuard<'a> {
    active: &'a DashMap<String, ()>,
    id: String,
}

impl Drop for ActiveFlowGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

fn parse_tokens(value: Value) -> anyhow::Result<AuthTokens> {
    serde_json::from_value(value).context("flow resolved with a non-token payload")
}

/// Construct the authorization url (and flow metadata) from the server's
/// oauth configuration. The `resource` parameter names the MCP server the
/// token is being requested for.
fn build_authorization_url(
    oauth: Option<&OAuthConfig>,
    server_url: Option<&str>,
    principal: &str,
    server: &str,
) -> anyhow::Result<(String, Value)> {
    let oauth = oauth.ok_or_else(|| {
        anyhow!("server '{server}' requires authorization but has no oauth configuration")
    })?;

    let endpoint = oauth
        .authorization_endpoint
        .clone()
        .or_else(|| {
            oauth
                .issuer_url
                .as_ref()
                .map(|issuer| format!("{}/authorize", issuer.trim_end_matches('/')))
        })
        .ok_or_else(|| anyhow!("oauth configuration for '{server}' names no endpoint"))?;

    let mut url = url::Url::parse(&endpoint)
        .with_context(|| format!("invalid authorization endpoint for '{server}'"))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        if let Some(client_id) = &oauth.client_id {
            query.append_pair("client_id", client_id);
        }
        if let Some(redirect_uri) = &oauth.redirect_uri {
            query.append_pair("redirect_uri", redirect_uri);
        }
        if !oauth.scopes.is_empty() {
            query.append_pair("scope", &oauth.scopes.join(" "));
        }
        query.append_pair("state", &flow_id(principal, server));
        if let Some(resource) = server_url {
            query.append_pair("resource", resource);
        }
    }

    let auth_url = url.to_string();
    let metadata = json!({
        "server": server,
        "principal": principal,
        "auth_url": auth_url,
    });
    Ok((auth_url, metadata))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

async fn refresh_exchange(
    http: &reqwest::Client,
    oauth: Option<&OAuthConfig>,
    stale: &AuthTokens,
) -> anyhow::Result<AuthTokens> {
    let oauth = oauth.ok_or_else(|| anyhow!("no oauth configuration for refresh"))?;
    let endpoint = oauth
        .token_endpoint
        .clone()
        .or_else(|| {
            oauth
                .issuer_url
                .as_ref()
                .map(|issuer| format!("{}/token", issuer.trim_end_matches('/')))
        })
        .ok_or_else(|| anyhow!("oauth configuration names no token endpoint"))?;
    let refresh_token = stale
        .refresh_token
        .clone()
        .ok_or_else(|| anyhow!("no refresh token held"))?;

    let mut form = vec![
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("refresh_token".to_string(), refresh_token.clone()),
    ];
    let client_id = oauth
        .client_id
        .clone()
        .or_else(|| stale.client_info.as_ref().map(|c| c.client_id.clone()));
    if let Some(client_id) = client_id {
        form.push(("client_id".to_string(), client_id));
    }
    let client_secret = oauth
        .client_secret
        .clone()
        .or_else(|| stale.client_info.as_ref().and_then(|c| c.client_secret.clone()));
    if let Some(client_secret) = client_secret {
        form.push(("client_secret".to_string(), client_secret));
    }

    let response = http
        .post(&endpoint)
        .form(&form)
        .send()
        .await
        .context("refresh request failed")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("refresh exchange refused: HTTP {}", status.as_u16());
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .context("malformed token endpoint response")?;

    Ok(AuthTokens {
        access_token: parsed.access_token,
        // Servers may rotate or retain the refresh token.
        refresh_token: parsed.refresh_token.or(Some(refresh_token)),
        expires_at: parsed
            .expires_in
            .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
        token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
        scope: parsed.scope,
        client_info: stale.client_info.clone(),
    })
}
