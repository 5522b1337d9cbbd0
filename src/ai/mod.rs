//! Reply analysis: prompt assembly, model call, output repair, and the
//! deterministic fallback used whenever the model path is unusable.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ModelSettings;
use crate::db::models::{InboundMessage, KnowledgeDocument, Tenant};
use crate::db::{Database, DbError};
use crate::error::PipelineError;

pub mod fallback;
pub mod model;
pub mod policy;
pub mod prompt;
pub mod repair;

pub use model::{GeminiClient, ModelClient, ModelError};

const LOGGED_OUTPUT_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Queue ordering weight; larger drains first.
    pub fn rank(self) -> i64 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    /// Unknown or missing values read as `Medium`.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("high") | Some("urgent") => Self::High,
            Some("low") => Self::Low,
            _ => Self::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub should_reply: bool,
    pub priority: Priority,
    pub category: String,
    pub confidence: f64,
    pub reply: Option<String>,
    pub source: AnalysisSource,
    /// Why the policy gate overrode `should_reply`, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_note: Option<String>,
}

/// Per-tenant inputs to the prompt. Loaded once per tenant per cycle.
#[derive(Debug, Clone, Default)]
pub struct TenantContext {
    pub tenant_id: String,
    pub mailbox_address: String,
    pub display_name: Option<String>,
    pub custom_prompt: Option<String>,
    pub knowledge: Vec<KnowledgeDocument>,
}

impl TenantContext {
    pub fn load(db: &Database, tenant: &Tenant) -> Result<Self, DbError> {
        Ok(Self {
            tenant_id: tenant.tenant_id.clone(),
            mailbox_address: tenant.mailbox_address.clone(),
            display_name: tenant.display_name.clone(),
            custom_prompt: db.get_custom_prompt(&tenant.tenant_id)?,
            knowledge: db.list_knowledge_documents(&tenant.tenant_id)?,
        })
    }
}

/// State that lives for one pipeline cycle only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleState {
    /// Set on the first model 429; later messages go straight to the fallback.
    pub model_rate_limited: bool,
    pub model_calls: u32,
    pub fallbacks: u32,
}

pub struct AnalysisService<'a> {
    model: Option<&'a dyn ModelClient>,
    settings: &'a ModelSettings,
}

impl<'a> AnalysisService<'a> {
    pub fn new(model: Option<&'a dyn ModelClient>, settings: &'a ModelSettings) -> Self {
        Self { model, settings }
    }

    /// Never fails: every model problem degrades to the deterministic
    /// analysis, and the policy gate runs on whichever verdict came out.
    pub async fn analyze(
        &self,
        message: &InboundMessage,
        ctx: &TenantContext,
        cycle: &mut CycleState,
    ) -> Analysis {
        let analysis = match self.model_analysis(message, ctx, cycle).await {
            Some(analysis) => analysis,
            None => {
                cycle.fallbacks += 1;
                fallback::analyze(message, &ctx.mailbox_address)
            }
        };
        policy::apply(analysis, message, &ctx.mailbox_address, self.settings.min_confidence)
    }

    async fn model_analysis(
        &self,
        message: &InboundMessage,
        ctx: &TenantContext,
        cycle: &mut CycleState,
    ) -> Option<Analysis> {
        let Some(model) = self.model else {
            debug!(tenant_id = %ctx.tenant_id, "no model configured; using fallback analysis");
            return None;
        };
        if cycle.model_rate_limited {
            debug!(tenant_id = %ctx.tenant_id, "model rate limited earlier this cycle");
            return None;
        }

        let prompt = prompt::build_prompt(message, ctx, self.settings);
        cycle.model_calls += 1;
        let raw = match model.generate(&prompt).await {
            Ok(raw) => raw,
            Err(ModelError::RateLimited(detail)) => {
                cycle.model_rate_limited = true;
                warn!(
                    tenant_id = %ctx.tenant_id,
                    error = %PipelineError::ModelRateLimited,
                    detail,
                    "falling back for the rest of the cycle"
                );
                return None;
            }
            Err(error) => {
                warn!(tenant_id = %ctx.tenant_id, model = model.name(), %error, "model call failed");
                return None;
            }
        };

        match repair::parse_verdicts(&raw) {
            Ok(verdicts) => verdicts
                .into_iter()
                .next()
                .map(|verdict| verdict.into_analysis()),
            Err(failure) => {
                let error = PipelineError::MalformedModelOutput {
                    detail: failure.to_string(),
                };
                warn!(
                    tenant_id = %ctx.tenant_id,
                    message_id = %message.id,
                    %error,
                    output = %truncate_for_log(&raw),
                    "using fallback analysis"
                );
                None
            }
        }
    }
}

fn truncate_for_log(raw: &str) -> String {
    if raw.chars().count() <= LOGGED_OUTPUT_MAX_CHARS {
        raw.to_string()
    } else {
        let head: String = raw.chars().take(LOGGED_OUTPUT_MAX_CHARS).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use async_trait::async_trait;

    use super::{AnalysisService, AnalysisSource, CycleState, Priority, TenantContext};
    use crate::ai::model::{ModelClient, ModelError};
    use crate::config::ModelSettings;
    use crate::db::models::InboundMessage;

    struct ScriptedModel {
        replies: RefCell<Vec<Result<String, ModelError>>>,
        calls: Cell<usize>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, ModelError>>) -> Self {
            Self {
                replies: RefCell::new(replies),
                calls: Cell::new(0),
            }
        }
    }

    #[async_trait(?Send)]
    impl ModelClient for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
            self.calls.set(self.calls.get() + 1);
            let mut replies = self.replies.borrow_mut();
            if replies.is_empty() {
                return Err(ModelError::Unavailable("script exhausted".to_string()));
            }
            replies.remove(0)
        }
    }

    fn message(subject: &str, body: &str) -> InboundMessage {
        InboundMessage {
            id: "m-1".to_string(),
            subject: Some(subject.to_string()),
            from_address: Some("student@example.com".to_string()),
            from_name: Some("Sam".to_string()),
            body_text: Some(body.to_string()),
            body_preview: None,
            received_at: "2026-06-01T09:00:00Z".to_string(),
            conversation_id: None,
        }
    }

    fn ctx() -> TenantContext {
        TenantContext {
            tenant_id: "t-1".to_string(),
            mailbox_address: "office@example.edu".to_string(),
            ..TenantContext::default()
        }
    }

    #[test]
    fn priority_parsing_is_lenient() {
        assert_eq!(Priority::parse_lenient(Some(" HIGH ")), Priority::High);
        assert_eq!(Priority::parse_lenient(Some("whenever")), Priority::Medium);
        assert_eq!(Priority::parse_lenient(None), Priority::Medium);
        assert!(Priority::High.rank() > Priority::Low.rank());
    }

    #[tokio::test]
    async fn fenced_model_output_is_used() {
        let model = ScriptedModel::new(vec![Ok(
            "```json\n[{\"shouldReply\": true, \"priority\": \"high\", \"category\": \"visa\", \"confidence\": 0.9, \"response\": \"Your visa letter is ready.\"}]\n```".to_string(),
        )]);
        let settings = ModelSettings::default();
        let service = AnalysisService::new(Some(&model), &settings);
        let mut cycle = CycleState::default();

        let analysis = service
            .analyze(&message("Visa letter", "When will it be ready?"), &ctx(), &mut cycle)
            .await;
        assert_eq!(analysis.source, AnalysisSource::Model);
        assert!(analysis.should_reply);
        assert_eq!(analysis.priority, Priority::High);
        assert_eq!(analysis.category, "visa");
        assert_eq!(cycle.fallbacks, 0);
    }

    #[tokio::test]
    async fn rate_limit_switches_the_rest_of_the_cycle_to_fallback() {
        let model = ScriptedModel::new(vec![
            Err(ModelError::RateLimited("quota".to_string())),
            Ok("[]".to_string()),
        ]);
        let settings = ModelSettings::default();
        let service = AnalysisService::new(Some(&model), &settings);
        let mut cycle = CycleState::default();

        for _ in 0..3 {
            let analysis = service
                .analyze(&message("Tuition fees", "How much is tuition?"), &ctx(), &mut cycle)
                .await;
            assert_eq!(analysis.source, AnalysisSource::Fallback);
            assert_eq!(analysis.category, "fees");
        }
        assert!(cycle.model_rate_limited);
        assert_eq!(model.calls.get(), 1);
        assert_eq!(cycle.fallbacks, 3);
    }

    #[tokio::test]
    async fn unrepairable_output_falls_back() {
        let model = ScriptedModel::new(vec![Ok("I cannot answer that.".to_string())]);
        let settings = ModelSettings::default();
        let service = AnalysisService::new(Some(&model), &settings);
        let mut cycle = CycleState::default();

        let analysis = service
            .analyze(&message("Scholarship", "Any funding?"), &ctx(), &mut cycle)
            .await;
        assert_eq!(analysis.source, AnalysisSource::Fallback);
        assert_eq!(analysis.category, "scholarships");
        assert!(!cycle.model_rate_limited);
    }

    #[tokio::test]
    async fn missing_model_uses_fallback_without_calls() {
        let settings = ModelSettings::default();
        let service = AnalysisService::new(None, &settings);
        let mut cycle = CycleState::default();

        let analysis = service
            .analyze(&message("Hello", "General question"), &ctx(), &mut cycle)
            .await;
        assert_eq!(analysis.source, AnalysisSource::Fallback);
        assert_eq!(cycle.model_calls, 0);
    }

    #[tokio::test]
    async fn low_confidence_model_verdict_is_vetoed() {
        let model = ScriptedModel::new(vec![Ok(
            r#"{"shouldReply": true, "priority": "low", "category": "general", "confidence": 0.1, "response": "Maybe?"}"#
                .to_string(),
        )]);
        let settings = ModelSettings::default();
        let service = AnalysisService::new(Some(&model), &settings);
        let mut cycle = CycleState::default();

        let analysis = service
            .analyze(&message("Hi", "Unclear request"), &ctx(), &mut cycle)
            .await;
        assert_eq!(analysis.source, AnalysisSource::Model);
        assert!(!analysis.should_reply);
        assert!(analysis
            .policy_note
            .as_deref()
            .is_some_and(|note| note.contains("confidence")));
    }
}
