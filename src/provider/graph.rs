use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::db::models::InboundMessage;
use crate::provider::{AppCredentials, MailProvider, OutboundReply, ProviderError, TokenGrant};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const DELEGATED_SCOPE: &str = "offline_access https://graph.microsoft.com/Mail.ReadWrite https://graph.microsoft.com/Mail.Send";
const TOKEN_SKEW_SECONDS: i64 = 60;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;
const PREVIEW_MAX_CHARS: usize = 240;

const MESSAGE_SELECT_FIELDS: &str =
    "id,subject,from,body,bodyPreview,receivedDateTime,conversationId";

/// Microsoft Graph mailbox access (delegated or application permissions).
#[derive(Debug, Clone)]
pub struct GraphMailProvider {
    client: Client,
    api_base: String,
    token_url: String,
    page_size: usize,
}

impl GraphMailProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            client: Client::new(),
            api_base: settings.graph_api_base.trim_end_matches('/').to_string(),
            token_url: settings.token_url.clone(),
            page_size: 25,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn token_url_for(&self, app: &AppCredentials) -> String {
        self.token_url.replace("{tenant}", &app.directory_tenant_id)
    }

    fn inbox_messages_url(&self, mailbox: &str, since: DateTime<Utc>) -> Result<String, ProviderError> {
        let endpoint = format!("{}/users/{mailbox}/mailFolders/inbox/messages", self.api_base);
        let mut url = Url::parse(&endpoint)
            .map_err(|e| ProviderError::Invalid(format!("parse graph URL {endpoint}: {e}")))?;
        url.query_pairs_mut()
            .append_pair(
                "$filter",
                &format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            )
            .append_pair("$orderby", "receivedDateTime asc")
            .append_pair("$top", &self.page_size.to_string())
            .append_pair("$select", MESSAGE_SELECT_FIELDS);
        Ok(url.to_string())
    }

    async fn request_token(
        &self,
        app: &AppCredentials,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, ProviderError> {
        let token_url = self.token_url_for(app);
        let response = self
            .client
            .post(&token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("request token from {token_url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("read token response: {e}")))?;
        if !status.is_success() {
            return Err(classify_token_failure(status, &body));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Invalid(format!("decode token JSON response: {e}")))?;
        let expires_at = Utc::now()
            + Duration::seconds((payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS));

        Ok(TokenGrant {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token.filter(|value| !value.trim().is_empty()),
            expires_at,
        })
    }

    async fn get_json_with_retry<T: DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
        what: &str,
    ) -> Result<T, ProviderError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url)
                .bearer_auth(token)
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("request graph {what}: {e}")))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let retry_after_seconds = retry_after(&response).unwrap_or(backoff_seconds);
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::RateLimited(format!(
                        "graph {what} exhausted retries: {}",
                        redact_response_body(&body)
                    )));
                }

                debug!(what, attempt, retry_after_seconds, "graph throttled request");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("read graph {what} body: {e}")))?;
            if !status.is_success() {
                return Err(classify_api_failure(status, &body, what));
            }

            return serde_json::from_str(&body)
                .map_err(|e| ProviderError::Invalid(format!("decode graph {what} JSON: {e}")));
        }

        Err(ProviderError::Unavailable(format!(
            "graph {what} request failed without response"
        )))
    }
}

#[async_trait(?Send)]
impl MailProvider for GraphMailProvider {
    fn name(&self) -> &str {
        "graph_api"
    }

    async fn check_access(&self, mailbox: &str, access_token: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/users/{mailbox}/mailFolders/inbox?$select=id",
            self.api_base
        );
        let _: serde_json::Value = self
            .get_json_with_retry(access_token, &url, "inbox access check")
            .await?;
        Ok(())
    }

    async fn refresh_token_grant(
        &self,
        app: &AppCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.request_token(
            app,
            &[
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
                ("scope", DELEGATED_SCOPE),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
        )
        .await
    }

    async fn client_credentials_grant(
        &self,
        app: &AppCredentials,
    ) -> Result<TokenGrant, ProviderError> {
        self.request_token(
            app,
            &[
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ],
        )
        .await
    }

    async fn list_messages_since(
        &self,
        mailbox: &str,
        access_token: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ProviderError> {
        let mut messages = Vec::new();
        let mut next_url = Some(self.inbox_messages_url(mailbox, since)?);
        let mut page_number = 0u64;

        while let Some(url) = next_url.take() {
            let page: GraphMessagesPage = self
                .get_json_with_retry(access_token, &url, "messages page")
                .await?;
            page_number += 1;

            for message in page.value {
                match map_graph_message(message) {
                    Some(mapped) => messages.push(mapped),
                    None => warn!(mailbox, "skipping graph message without id"),
                }
                if messages.len() >= limit {
                    return Ok(messages);
                }
            }

            debug!(mailbox, page_number, fetched = messages.len(), "graph messages page");
            next_url = page.next_link;
        }

        Ok(messages)
    }

    async fn send_reply(
        &self,
        mailbox: &str,
        access_token: &str,
        reply: &OutboundReply,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/users/{mailbox}/messages/{}/reply",
            self.api_base, reply.message_id
        );
        let payload = json!({
            "message": {
                "toRecipients": [{ "emailAddress": { "address": reply.recipient } }]
            },
            "comment": reply.body,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("post graph reply: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited(redact_response_body(&body)));
        }
        Err(classify_api_failure(status, &body, "reply"))
    }
}

fn retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn classify_api_failure(status: StatusCode, body: &str, what: &str) -> ProviderError {
    let detail = format!(
        "graph {what} failed: status={} body={}",
        status,
        redact_response_body(body)
    );
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ProviderError::Unauthorized(detail)
    } else if status.is_server_error() {
        ProviderError::Unavailable(detail)
    } else {
        ProviderError::Invalid(detail)
    }
}

fn classify_token_failure(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!(
        "token request failed: status={} body={}",
        status,
        redact_response_body(body)
    );
    let lowered = body.to_ascii_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited(detail)
    } else if status.is_server_error() {
        ProviderError::Unavailable(detail)
    } else if status == StatusCode::UNAUTHORIZED
        || lowered.contains("invalid_grant")
        || lowered.contains("invalid_client")
        || lowered.contains("unauthorized_client")
    {
        ProviderError::Unauthorized(detail)
    } else {
        ProviderError::Invalid(detail)
    }
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = (0..=REDACTED_BODY_MAX_LEN)
            .rev()
            .find(|idx| trimmed.is_char_boundary(*idx))
            .unwrap_or(0);
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}

fn map_graph_message(message: GraphMessage) -> Option<InboundMessage> {
    let id = message.id.filter(|value| !value.trim().is_empty())?;

    let (from_name, from_address) = message
        .from
        .as_ref()
        .map(GraphRecipient::name_address_pair)
        .unwrap_or((None, None));

    let body_text = body_text(message.body.as_ref());
    let body_preview = message.body_preview.or_else(|| {
        body_text.as_ref().and_then(|text| {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.chars().take(PREVIEW_MAX_CHARS).collect::<String>())
            }
        })
    });

    Some(InboundMessage {
        id,
        subject: message.subject,
        from_address,
        from_name,
        body_text,
        body_preview,
        received_at: message
            .received_date_time
            .unwrap_or_else(|| Utc::now().to_rfc3339()),
        conversation_id: message.conversation_id,
    })
}

fn body_text(body: Option<&GraphBody>) -> Option<String> {
    let body = body?;
    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())?;

    if body
        .content_type
        .as_deref()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("html"))
    {
        let plain = std::panic::catch_unwind(|| {
            html2text::from_read(content.as_bytes(), 120)
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .unwrap_or_default();
        return if plain.is_empty() { None } else { Some(plain) };
    }

    Some(content.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessagesPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    body: Option<GraphBody>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    fn name_address_pair(&self) -> (Option<String>, Option<String>) {
        let Some(email) = self.email_address.as_ref() else {
            return (None, None);
        };
        let clean = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        (clean(email.name.as_deref()), clean(email.address.as_deref()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}
