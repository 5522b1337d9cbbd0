use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

use crate::db::parse_timestamp;

/// Outcome recorded for a provider message once the pipeline has looked at it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Sent,
    Failed,
    Skipped,
    Queued,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Queued => "queued",
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "queued" => Ok(Self::Queued),
            other => Err(format!("invalid record status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("invalid queue status: {other}")),
        }
    }
}

/// A connected mailbox and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub tenant_id: String,
    pub mailbox_address: String,
    pub display_name: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub active: bool,
    /// Watermark: the start of the last completed fetch cycle.
    pub last_checked_at: Option<String>,
    pub emails_processed: i64,
    pub emails_replied: i64,
    pub created_at: Option<String>,
    pub config: Option<serde_json::Value>,
}

impl Tenant {
    pub fn new(tenant_id: &str, mailbox_address: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            mailbox_address: mailbox_address.to_string(),
            display_name: None,
            access_token: None,
            refresh_token: None,
            active: true,
            last_checked_at: None,
            emails_processed: 0,
            emails_replied: 0,
            created_at: None,
            config: None,
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at.as_deref().and_then(parse_timestamp)
    }

    pub fn config_str(&self, key: &str) -> Option<String> {
        self.config
            .as_ref()
            .and_then(|config| config.get(key))
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// A message as returned by the mail provider. Never persisted whole except
/// inside queue payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub body_text: Option<String>,
    pub body_preview: Option<String>,
    pub received_at: String,
    pub conversation_id: Option<String>,
}

impl InboundMessage {
    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }

    pub fn sender(&self) -> &str {
        self.from_address.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn body(&self) -> &str {
        self.body_text
            .as_deref()
            .filter(|body| !body.trim().is_empty())
            .or(self.body_preview.as_deref())
            .unwrap_or("")
    }

    pub fn received(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.received_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedRecord {
    pub tenant_id: String,
    pub message_id: String,
    pub connection_address: String,
    pub status: RecordStatus,
    pub sender_address: Option<String>,
    pub subject: Option<String>,
    pub analysis: Option<serde_json::Value>,
    pub response_text: Option<String>,
    pub error_detail: Option<String>,
    pub processed_at: String,
}

/// Burst and minute windows are counters; the hour and day fields mirror the
/// reservation log as of the last reserved send, with each window's start
/// being its oldest reservation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitState {
    pub tenant_id: String,
    pub burst_count: i64,
    pub burst_window_start: Option<DateTime<Utc>>,
    pub minute_count: i64,
    pub minute_window_start: Option<DateTime<Utc>>,
    pub hourly_count: i64,
    pub hour_window_start: Option<DateTime<Utc>>,
    pub daily_count: i64,
    pub day_window_start: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Reservations inside the trailing hour and day, with the oldest of each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingUsage {
    pub hour: i64,
    pub hour_oldest: Option<DateTime<Utc>>,
    pub day: i64,
    pub day_oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub tenant_id: String,
    pub payload: InboundMessage,
    pub status: QueueStatus,
    pub priority: i64,
    pub created_at: String,
    pub send_after: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeDocument {
    pub id: i64,
    pub tenant_id: String,
    pub title: String,
    pub content: String,
    pub created_at: Option<String>,
}

fn parse_json_value(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
}

fn parse_optional_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}

pub(crate) fn enum_from_row<T: FromStr<Err = String>>(row: &Row<'_>, column: &str) -> SqlResult<T> {
    let raw: String = row.get(column)?;
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

impl Tenant {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            tenant_id: row.get("tenant_id")?,
            mailbox_address: row.get("mailbox_address")?,
            display_name: row.get("display_name")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            active: row.get("active")?,
            last_checked_at: row.get("last_checked_at")?,
            emails_processed: row.get("emails_processed")?,
            emails_replied: row.get("emails_replied")?,
            created_at: row.get("created_at")?,
            config: parse_json_value(row.get("config")?),
        })
    }
}

impl ProcessedRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            tenant_id: row.get("tenant_id")?,
            message_id: row.get("message_id")?,
            connection_address: row.get("connection_address")?,
            status: enum_from_row(row, "status")?,
            sender_address: row.get("sender_address")?,
            subject: row.get("subject")?,
            analysis: parse_json_value(row.get("analysis")?),
            response_text: row.get("response_text")?,
            error_detail: row.get("error_detail")?,
            processed_at: row.get("processed_at")?,
        })
    }
}

impl RateLimitState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            tenant_id: row.get("tenant_id")?,
            burst_count: row.get("burst_count")?,
            burst_window_start: parse_optional_time(row.get("burst_window_start")?),
            minute_count: row.get("minute_count")?,
            minute_window_start: parse_optional_time(row.get("minute_window_start")?),
            hourly_count: row.get("hourly_count")?,
            hour_window_start: parse_optional_time(row.get("hour_window_start")?),
            daily_count: row.get("daily_count")?,
            day_window_start: parse_optional_time(row.get("day_window_start")?),
            last_sent_at: parse_optional_time(row.get("last_sent_at")?),
        })
    }
}

impl QueueItem {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let raw_payload: String = row.get("payload")?;
        let payload = serde_json::from_str::<InboundMessage>(&raw_payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                raw_payload.len(),
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            payload,
            status: enum_from_row(row, "status")?,
            priority: row.get("priority")?,
            created_at: row.get("created_at")?,
            send_after: row.get("send_after")?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
        })
    }
}

impl KnowledgeDocument {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            title: row.get("title")?,
            content: row.get("content")?,
            created_at: row.get("created_at")?,
        })
    }
}
