use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::ai::AnalysisSource;
use crate::db::models::InboundMessage;
use crate::db::timestamp;
use crate::pipeline::Pipeline;

const SAMPLE_SUBJECT: &str = "Question about admission requirements";
const SAMPLE_BODY: &str = "Hello, I would like to know the admission requirements and the \
application deadline for the next intake. Thank you.";
const SAMPLE_SENDER: &str = "test.applicant@example.com";

/// A message handed in from outside the fetch cycle. Field names follow the
/// stored message shape, with the short forms callers tend to send.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ExternalEmail {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "from", alias = "sender")]
    pub from_address: Option<String>,
    #[serde(default, alias = "fromName", alias = "sender_name")]
    pub from_name: Option<String>,
    #[serde(default, alias = "body", alias = "text")]
    pub body_text: Option<String>,
    #[serde(default, alias = "receivedAt", alias = "receivedDateTime")]
    pub received_at: Option<String>,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
}

impl ExternalEmail {
    pub fn into_message(self, now: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("manual-{}", Uuid::new_v4())),
            subject: self.subject,
            from_address: self.from_address,
            from_name: self.from_name,
            body_text: self.body_text,
            body_preview: None,
            received_at: self.received_at.unwrap_or_else(|| timestamp(now)),
            conversation_id: self.conversation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerRequest {
    ProcessAll,
    ProcessTenant { tenant: String },
    Enqueue { tenant: String, email: ExternalEmail },
    TestAi { tenant: String, email: Option<ExternalEmail> },
}

pub fn sample_message(now: DateTime<Utc>) -> InboundMessage {
    InboundMessage {
        id: format!("test-ai-{}", Uuid::new_v4()),
        subject: Some(SAMPLE_SUBJECT.to_string()),
        from_address: Some(SAMPLE_SENDER.to_string()),
        from_name: Some("Test Applicant".to_string()),
        body_text: Some(SAMPLE_BODY.to_string()),
        body_preview: None,
        received_at: timestamp(now),
        conversation_id: None,
    }
}

fn tenant_field(body: &Map<String, Value>) -> Option<String> {
    ["tenant", "tenant_id", "tenantId"]
        .iter()
        .filter_map(|key| body.get(*key))
        .find_map(|value| match value {
            Value::String(raw) => Some(raw.trim().to_string()),
            Value::Object(object) => object
                .get("tenant_id")
                .or_else(|| object.get("id"))
                .and_then(Value::as_str)
                .map(|raw| raw.trim().to_string()),
            _ => None,
        })
        .filter(|tenant| !tenant.is_empty())
}

fn email_field(body: &Map<String, Value>) -> Result<Option<ExternalEmail>, String> {
    match body.get("email") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value::<ExternalEmail>(value.clone())
            .map(Some)
            .map_err(|error| format!("invalid email payload: {error}")),
    }
}

pub fn parse_request(body: Option<&Value>) -> Result<TriggerRequest, String> {
    let object = match body {
        None | Some(Value::Null) => return Ok(TriggerRequest::ProcessAll),
        Some(Value::Object(object)) if object.is_empty() => return Ok(TriggerRequest::ProcessAll),
        Some(Value::Object(object)) => object,
        Some(_) => return Err("request body must be a JSON object".to_string()),
    };

    let tenant = tenant_field(object);
    let require_tenant =
        |tenant: Option<String>| tenant.ok_or_else(|| "missing required field 'tenant'".to_string());

    match object.get("action").and_then(Value::as_str).map(str::trim) {
        Some("process_user_emails") => Ok(TriggerRequest::ProcessTenant {
            tenant: require_tenant(tenant)?,
        }),
        Some("test_ai") => Ok(TriggerRequest::TestAi {
            tenant: require_tenant(tenant)?,
            email: email_field(object)?,
        }),
        Some("process_all") => Ok(TriggerRequest::ProcessAll),
        Some(other) => Err(format!("unknown action '{other}'")),
        None => match email_field(object)? {
            Some(email) => Ok(TriggerRequest::Enqueue {
                tenant: require_tenant(tenant)?,
                email,
            }),
            None => Err("request needs an 'action' or an 'email'".to_string()),
        },
    }
}

fn respond(success: bool, message: impl Into<String>, payload: Value) -> Value {
    let mut response = json!({
        "success": success,
        "message": message.into(),
    });
    if let (Some(target), Value::Object(extra)) = (response.as_object_mut(), payload) {
        target.extend(extra);
    }
    response
}

/// Entry point shared by the stdio server and the one-shot CLI command.
/// Always answers with `{success, message, ...}`; errors never escape.
pub async fn handle_request(pipeline: &Pipeline<'_>, body: Option<Value>) -> Value {
    let request = match parse_request(body.as_ref()) {
        Ok(request) => request,
        Err(error) => return respond(false, error, Value::Null),
    };

    match request {
        TriggerRequest::ProcessAll => match pipeline.process_all().await {
            Ok(report) => respond(
                true,
                format!(
                    "processed {} tenant(s): {} queued, {} skipped",
                    report.tenants.len(),
                    report.queued(),
                    report.skipped()
                ),
                json!({ "report": report }),
            ),
            Err(error) => {
                warn!(%error, "trigger cycle failed");
                respond(false, error.to_string(), Value::Null)
            }
        },
        TriggerRequest::ProcessTenant { tenant } => match pipeline.process_tenant(&tenant).await {
            Ok(report) => {
                let success = report.error.is_none();
                let message = match &report.error {
                    Some(error) => format!("tenant {tenant}: {error}"),
                    None => format!(
                        "tenant {tenant}: {} queued, {} skipped",
                        report.queued, report.skipped
                    ),
                };
                respond(success, message, json!({ "report": report }))
            }
            Err(error) => respond(false, error.to_string(), Value::Null),
        },
        TriggerRequest::Enqueue { tenant, email } => {
            let message = email.into_message(pipeline.now());
            match pipeline.enqueue_external(&tenant, &message) {
                Ok(Some(id)) => respond(
                    true,
                    format!("message {} queued", message.id),
                    json!({ "queue_item_id": id, "message_id": message.id }),
                ),
                Ok(None) => respond(
                    false,
                    format!("message {} was already processed", message.id),
                    json!({ "message_id": message.id }),
                ),
                Err(error) => respond(false, error.to_string(), Value::Null),
            }
        }
        TriggerRequest::TestAi { tenant, email } => {
            let now = pipeline.now();
            let message = email
                .map(|email| email.into_message(now))
                .unwrap_or_else(|| sample_message(now));
            match pipeline.dry_run_analysis(&tenant, &message).await {
                Ok(analysis) => {
                    let via = match analysis.source {
                        AnalysisSource::Model => "model",
                        AnalysisSource::Fallback => "fallback",
                    };
                    respond(
                        true,
                        format!("analysis via {via}"),
                        json!({ "analysis": analysis }),
                    )
                }
                Err(error) => respond(false, error.to_string(), Value::Null),
            }
        }
    }
}
