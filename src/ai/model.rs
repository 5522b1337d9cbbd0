use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelSettings;

const RESPONSE_MIME_TYPE: &str = "application/json";
const TEMPERATURE: f32 = 0.2;
const ERROR_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model rate limited: {0}")]
    RateLimited(String),

    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model request rejected: {0}")]
    Invalid(String),
}

#[async_trait(?Send)]
pub trait ModelClient {
    fn name(&self) -> &str;

    /// One completion for one prompt; returns the raw text.
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Google Generative Language `generateContent` client.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    /// `None` when no API key is configured.
    pub fn from_settings(settings: &ModelSettings) -> Option<Self> {
        let api_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())?;
        Some(Self {
            client: Client::new(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(ERROR_BODY_MAX_LEN).collect();
        format!("{head}…")
    }
}

#[async_trait(?Send)]
impl ModelClient for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                response_mime_type: RESPONSE_MIME_TYPE,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModelError::Unavailable(format!("request generateContent: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModelError::Unavailable(format!("read generateContent body: {e}")))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::RateLimited(truncate_body(&body)));
        }
        if status.is_server_error() {
            return Err(ModelError::Unavailable(format!(
                "status={status} body={}",
                truncate_body(&body)
            )));
        }
        if !status.is_success() {
            return Err(ModelError::Invalid(format!(
                "status={status} body={}",
                truncate_body(&body)
            )));
        }

        let decoded: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ModelError::Invalid(format!("decode generateContent JSON: {e}")))?;
        let text = decoded
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(ModelError::Invalid("model returned no text".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{GeminiClient, ModelClient, ModelError};
    use crate::config::ModelSettings;

    fn client_for(server: &MockServer) -> GeminiClient {
        GeminiClient::from_settings(&ModelSettings {
            api_key: Some("key-1".to_string()),
            api_base: server.uri(),
            ..ModelSettings::default()
        })
        .expect("client configured")
    }

    #[test]
    fn missing_api_key_disables_the_client() {
        assert!(GeminiClient::from_settings(&ModelSettings::default()).is_none());
        let blank = ModelSettings {
            api_key: Some("   ".to_string()),
            ..ModelSettings::default()
        };
        assert!(GeminiClient::from_settings(&blank).is_none());
    }

    #[tokio::test]
    async fn generate_joins_candidate_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "key-1"))
            .and(body_string_contains("responseMimeType"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "[{\"shouldReply\": " }, { "text": "false}]" }] }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = client_for(&server)
            .generate("prompt")
            .await
            .expect("generate");
        assert_eq!(text, "[{\"shouldReply\": false}]");
    }

    #[tokio::test]
    async fn quota_errors_map_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).set_body_string(r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#),
            )
            .mount(&server)
            .await;

        let error = client_for(&server)
            .generate("prompt")
            .await
            .expect_err("rate limited");
        assert!(matches!(error, ModelError::RateLimited(_)));
    }

    #[tokio::test]
    async fn empty_candidates_are_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .mount(&server)
            .await;

        let error = client_for(&server)
            .generate("prompt")
            .await
            .expect_err("no text");
        assert!(matches!(error, ModelError::Invalid(_)));
    }
}
