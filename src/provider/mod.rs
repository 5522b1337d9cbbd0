use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::InboundMessage;

pub mod graph;

pub use graph::GraphMailProvider;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// 401/403 or an `invalid_grant` style rejection.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or 5xx; worth retrying on the next cycle.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Configuration or payload problem that retrying will not fix.
    #[error("invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present for delegated grants; application grants carry none.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// App registration used for client-credentials and refresh grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub directory_tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub message_id: String,
    pub recipient: String,
    pub body: String,
}

/// Everything the pipeline needs from a mailbox provider.
#[async_trait(?Send)]
pub trait MailProvider {
    fn name(&self) -> &str;

    /// Cheap authenticated no-op used to validate a stored access token.
    async fn check_access(&self, mailbox: &str, access_token: &str) -> Result<(), ProviderError>;

    async fn refresh_token_grant(
        &self,
        app: &AppCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError>;

    async fn client_credentials_grant(
        &self,
        app: &AppCredentials,
    ) -> Result<TokenGrant, ProviderError>;

    /// Messages received at or after `since`, oldest first, at most `limit`.
    async fn list_messages_since(
        &self,
        mailbox: &str,
        access_token: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ProviderError>;

    async fn send_reply(
        &self,
        mailbox: &str,
        access_token: &str,
        reply: &OutboundReply,
    ) -> Result<(), ProviderError>;
}
