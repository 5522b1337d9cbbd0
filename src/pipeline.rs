//! One polling cycle: credentials, fetch, filter, guard, analysis, enqueue.
//!
//! Every message is checkpointed before the next one is looked at: rejected
//! messages get a `skipped` record, accepted ones get a `queued` record and a
//! queue item in the same transaction. A cycle cut short leaves nothing half
//! applied.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::{Analysis, AnalysisService, CycleState, ModelClient, TenantContext};
use crate::config::Settings;
use crate::credentials::{CredentialManager, TokenSeal};
use crate::db::models::{InboundMessage, ProcessedRecord, RecordStatus, Tenant};
use crate::db::{timestamp, Database};
use crate::error::PipelineError;
use crate::fetcher::Fetcher;
use crate::filter::{self, FilterContext, FilterVerdict, RejectReason};
use crate::guard::pacing;
use crate::guard::{BlockReason, GuardDecision, RateLimiter};
use crate::provider::MailProvider;
use crate::queue::{NoopSignal, Queue, WorkerSignal};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

static SYSTEM_CLOCK: SystemClock = SystemClock;
static NOOP_SIGNAL: NoopSignal = NoopSignal;

/// Why a message did not become a queued reply.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Filtered(RejectReason),
    RateLimited(BlockReason),
    Declined(Option<String>),
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filtered(reason) => write!(f, "filtered: {reason}"),
            Self::RateLimited(reason) => write!(f, "rate_limited: {reason}"),
            Self::Declined(Some(note)) => write!(f, "declined: {note}"),
            Self::Declined(None) => f.write_str("declined: no reply needed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedReply {
    pub record: ProcessedRecord,
    pub analysis: Analysis,
    pub send_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Budget reserved and a reply drafted; the caller persists `record`.
    Queued(QueuedReply),
    /// Already recorded as `skipped` where the reason warrants a record.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantReport {
    pub tenant_id: String,
    pub fetched: usize,
    pub queued: usize,
    pub skipped: usize,
    pub already_processed: usize,
    pub rate_limited: usize,
    pub model_calls: u32,
    pub fallbacks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TenantReport {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Self::default()
        }
    }

    fn failed(tenant_id: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(tenant_id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: String,
    pub tenants: Vec<TenantReport>,
}

impl CycleReport {
    pub fn queued(&self) -> usize {
        self.tenants.iter().map(|tenant| tenant.queued).sum()
    }

    pub fn skipped(&self) -> usize {
        self.tenants.iter().map(|tenant| tenant.skipped).sum()
    }

    pub fn failed_tenants(&self) -> usize {
        self.tenants
            .iter()
            .filter(|tenant| tenant.error.is_some())
            .count()
    }
}

pub struct Pipeline<'a> {
    db: &'a Database,
    provider: &'a dyn MailProvider,
    model: Option<&'a dyn ModelClient>,
    settings: &'a Settings,
    seal: Option<&'a TokenSeal>,
    signal: &'a dyn WorkerSignal,
    clock: &'a dyn Clock,
    rng: RefCell<StdRng>,
}

impl<'a> Pipeline<'a> {
    pub fn new(db: &'a Database, provider: &'a dyn MailProvider, settings: &'a Settings) -> Self {
        Self {
            db,
            provider,
            model: None,
            settings,
            seal: None,
            signal: &NOOP_SIGNAL,
            clock: &SYSTEM_CLOCK,
            rng: RefCell::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_model(mut self, model: Option<&'a dyn ModelClient>) -> Self {
        self.model = model;
        self
    }

    pub fn with_seal(mut self, seal: Option<&'a TokenSeal>) -> Self {
        self.seal = seal;
        self
    }

    pub fn with_signal(mut self, signal: &'a dyn WorkerSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rng_seed(self, seed: u64) -> Self {
        self.rng.replace(StdRng::seed_from_u64(seed));
        self
    }

    pub fn db(&self) -> &'a Database {
        self.db
    }

    pub fn provider(&self) -> &'a dyn MailProvider {
        self.provider
    }

    pub fn settings(&self) -> &'a Settings {
        self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn credentials(&self) -> CredentialManager<'a> {
        CredentialManager::new(self.db, self.provider, &self.settings.provider, self.seal)
    }

    pub fn analysis(&self) -> AnalysisService<'a> {
        AnalysisService::new(self.model, &self.settings.model)
    }

    /// Runs a cycle for every active tenant. A failing tenant is reported and
    /// the loop moves on.
    pub async fn process_all(&self) -> Result<CycleReport, PipelineError> {
        let started = self.clock.now();
        let tenants = self.db.list_active_tenants()?;
        let mut report = CycleReport {
            started_at: timestamp(started),
            tenants: Vec::with_capacity(tenants.len()),
        };

        for tenant in tenants {
            match self.run_tenant(&tenant).await {
                Ok(tenant_report) => report.tenants.push(tenant_report),
                Err(error) => {
                    if error.is_tenant_fatal() {
                        warn!(tenant_id = %tenant.tenant_id, %error, "tenant disabled until re-consent");
                    } else {
                        warn!(tenant_id = %tenant.tenant_id, %error, "tenant cycle failed; retrying next cycle");
                    }
                    report
                        .tenants
                        .push(TenantReport::failed(&tenant.tenant_id, error.to_string()));
                }
            }
        }

        info!(
            tenants = report.tenants.len(),
            queued = report.queued(),
            skipped = report.skipped(),
            failed_tenants = report.failed_tenants(),
            "cycle complete"
        );
        Ok(report)
    }

    pub async fn process_tenant(&self, tenant_id: &str) -> Result<TenantReport, PipelineError> {
        let tenant = self
            .db
            .get_tenant(tenant_id)?
            .ok_or_else(|| PipelineError::UnknownTenant(tenant_id.to_string()))?;
        if !tenant.active {
            return Ok(TenantReport::failed(
                tenant_id,
                "tenant inactive; re-consent required".to_string(),
            ));
        }
        self.run_tenant(&tenant).await
    }

    async fn run_tenant(&self, tenant: &Tenant) -> Result<TenantReport, PipelineError> {
        let started = self.clock.now();
        let mut report = TenantReport::new(&tenant.tenant_id);

        let token = self.credentials().ensure_valid_token(tenant).await?;
        let fetcher = Fetcher::new(self.provider, &self.settings.fetch);
        let since = fetcher.watermark_for(tenant, started);
        let messages = fetcher.fetch_since(tenant, &token.value, since).await?;
        report.fetched = messages.len();
        let next_watermark = fetcher.next_watermark(&messages, started);

        let ctx = TenantContext::load(self.db, tenant)?;
        let processed = self
            .db
            .processed_ids(&tenant.tenant_id, &tenant.mailbox_address)?;
        let markers = self.settings.signature_markers();
        let filter_ctx = FilterContext {
            tenant_address: &tenant.mailbox_address,
            processed_ids: &processed,
            signature_markers: &markers,
        };

        let (accepted, rejected) = filter::partition(messages, &filter_ctx);
        for (message, reason) in rejected {
            if reason.records_outcome() {
                self.record_skip(tenant, &message, &SkipReason::Filtered(reason), None)?;
                report.skipped += 1;
            } else {
                report.already_processed += 1;
            }
        }

        let mut cycle = CycleState::default();
        for message in accepted {
            match self.admit(tenant, &ctx, &message, &mut cycle).await? {
                MessageOutcome::Queued(queued) => {
                    self.checkpoint_queued(tenant, &message, &queued)?;
                    report.queued += 1;
                }
                MessageOutcome::Skipped(reason) => {
                    if matches!(reason, SkipReason::RateLimited(_)) {
                        report.rate_limited += 1;
                    }
                    report.skipped += 1;
                }
            }
        }
        report.model_calls = cycle.model_calls;
        report.fallbacks = cycle.fallbacks;

        self.db.advance_watermark(&tenant.tenant_id, next_watermark)?;
        self.db.bump_tenant_counters(
            &tenant.tenant_id,
            (report.queued + report.skipped) as i64,
            0,
        )?;

        info!(
            tenant_id = %tenant.tenant_id,
            fetched = report.fetched,
            queued = report.queued,
            skipped = report.skipped,
            rate_limited = report.rate_limited,
            "tenant cycle complete"
        );
        Ok(report)
    }

    /// Filter, guard and analysis for one message outside a fetched batch.
    pub async fn evaluate_message(
        &self,
        tenant: &Tenant,
        ctx: &TenantContext,
        message: &InboundMessage,
        processed: &HashSet<String>,
        cycle: &mut CycleState,
    ) -> Result<MessageOutcome, PipelineError> {
        let markers = self.settings.signature_markers();
        let filter_ctx = FilterContext {
            tenant_address: &tenant.mailbox_address,
            processed_ids: processed,
            signature_markers: &markers,
        };

        if let FilterVerdict::Reject(reason) = filter::evaluate(message, &filter_ctx) {
            let skip = SkipReason::Filtered(reason);
            if reason.records_outcome() {
                self.record_skip(tenant, message, &skip, None)?;
            }
            return Ok(MessageOutcome::Skipped(skip));
        }
        self.admit(tenant, ctx, message, cycle).await
    }

    /// Guard then analysis, for a message the filter has accepted.
    async fn admit(
        &self,
        tenant: &Tenant,
        ctx: &TenantContext,
        message: &InboundMessage,
        cycle: &mut CycleState,
    ) -> Result<MessageOutcome, PipelineError> {
        let now = self.clock.now();
        let limits = self.settings.rate_limits.for_tenant(tenant);

        if let GuardDecision::Blocked(reason) = RateLimiter::new(self.db).reserve(
            &tenant.tenant_id,
            Some(message.id.as_str()),
            &limits,
            now,
        )? {
            let skip = SkipReason::RateLimited(reason);
            self.record_skip(tenant, message, &skip, None)?;
            return Ok(MessageOutcome::Skipped(skip));
        }

        let analysis = self.analysis().analyze(message, ctx, cycle).await;
        if !analysis.should_reply {
            let skip = SkipReason::Declined(analysis.policy_note.clone());
            self.record_skip(tenant, message, &skip, Some(&analysis))?;
            return Ok(MessageOutcome::Skipped(skip));
        }

        let send_after = pacing::schedule_send(
            now,
            &analysis.category,
            analysis.priority,
            analysis.confidence,
            &self.settings.pacing,
            &mut *self.rng.borrow_mut(),
        );
        let mut record = new_record(tenant, message, RecordStatus::Queued, now);
        record.analysis = serde_json::to_value(&analysis).ok();
        record.response_text = analysis.reply.clone();

        Ok(MessageOutcome::Queued(QueuedReply {
            record,
            analysis,
            send_after,
        }))
    }

    /// The `queued` record and its queue item land together or not at all.
    fn checkpoint_queued(
        &self,
        tenant: &Tenant,
        message: &InboundMessage,
        queued: &QueuedReply,
    ) -> Result<i64, PipelineError> {
        let queue = Queue::new(self.db);
        let now = self.clock.now();
        let id = self.db.immediate(|_| {
            self.db.upsert_processed(&queued.record)?;
            queue.enqueue(
                &tenant.tenant_id,
                message,
                queued.analysis.priority,
                now,
                queued.send_after,
            )
        })?;
        self.signal.notify(&tenant.tenant_id, id);
        Ok(id)
    }

    /// Puts an externally supplied message on the queue. The worker runs the
    /// full evaluation when it claims the item.
    pub fn enqueue_external(
        &self,
        tenant_id: &str,
        message: &InboundMessage,
    ) -> Result<Option<i64>, PipelineError> {
        let tenant = self
            .db
            .get_tenant(tenant_id)?
            .ok_or_else(|| PipelineError::UnknownTenant(tenant_id.to_string()))?;
        if self
            .db
            .get_processed(tenant_id, &message.id, &tenant.mailbox_address)?
            .is_some()
        {
            debug!(tenant_id, message_id = %message.id, "external message already processed");
            return Ok(None);
        }

        let now = self.clock.now();
        let id = Queue::new(self.db).enqueue(
            tenant_id,
            message,
            crate::ai::Priority::Medium,
            now,
            now,
        )?;
        self.signal.notify(tenant_id, id);
        Ok(Some(id))
    }

    /// Analysis only, with nothing persisted and no budget consumed.
    pub async fn dry_run_analysis(
        &self,
        tenant_id: &str,
        message: &InboundMessage,
    ) -> Result<Analysis, PipelineError> {
        let tenant = self
            .db
            .get_tenant(tenant_id)?
            .ok_or_else(|| PipelineError::UnknownTenant(tenant_id.to_string()))?;
        let ctx = TenantContext::load(self.db, &tenant)?;
        let mut cycle = CycleState::default();
        Ok(self.analysis().analyze(message, &ctx, &mut cycle).await)
    }

    fn record_skip(
        &self,
        tenant: &Tenant,
        message: &InboundMessage,
        reason: &SkipReason,
        analysis: Option<&Analysis>,
    ) -> Result<(), PipelineError> {
        let mut record = new_record(tenant, message, RecordStatus::Skipped, self.clock.now());
        record.analysis = analysis.and_then(|analysis| serde_json::to_value(analysis).ok());
        record.error_detail = Some(reason.to_string());
        self.db.upsert_processed(&record)?;
        debug!(
            tenant_id = %tenant.tenant_id,
            message_id = %message.id,
            %reason,
            "message skipped"
        );
        Ok(())
    }
}

pub(crate) fn new_record(
    tenant: &Tenant,
    message: &InboundMessage,
    status: RecordStatus,
    now: DateTime<Utc>,
) -> ProcessedRecord {
    ProcessedRecord {
        tenant_id: tenant.tenant_id.clone(),
        message_id: message.id.clone(),
        connection_address: tenant.mailbox_address.clone(),
        status,
        sender_address: Some(message.sender().to_string()).filter(|sender| !sender.is_empty()),
        subject: message.subject.clone(),
        analysis: None,
        response_text: None,
        error_detail: None,
        processed_at: timestamp(now),
    }
}

#[cfg(test)]
mod tests {
    use super::{CycleReport, SkipReason, TenantReport};
    use crate::filter::RejectReason;
    use crate::guard::BlockReason;

    #[test]
    fn skip_reasons_render_their_tier() {
        assert_eq!(
            SkipReason::Filtered(RejectReason::SelfAuthored).to_string(),
            "filtered: self_authored"
        );
        assert_eq!(
            SkipReason::RateLimited(BlockReason::PerHour { count: 15, limit: 15 }).to_string(),
            "rate_limited: per_hour: 15/15"
        );
        assert_eq!(
            SkipReason::Declined(None).to_string(),
            "declined: no reply needed"
        );
    }

    #[test]
    fn cycle_report_totals() {
        let report = CycleReport {
            started_at: "2026-06-03T10:00:00.000Z".to_string(),
            tenants: vec![
                TenantReport {
                    tenant_id: "a".to_string(),
                    queued: 2,
                    skipped: 1,
                    ..TenantReport::default()
                },
                TenantReport {
                    tenant_id: "b".to_string(),
                    error: Some("mail provider unavailable".to_string()),
                    ..TenantReport::default()
                },
            ],
        };
        assert_eq!(report.queued(), 2);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed_tenants(), 1);
    }
}
