//! Queue consumer: posts drafted replies and records the outcome.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::ai::{CycleState, TenantContext};
use crate::db::models::{ProcessedRecord, QueueItem, RecordStatus, Tenant};
use crate::db::timestamp;
use crate::error::PipelineError;
use crate::pipeline::{MessageOutcome, Pipeline};
use crate::provider::OutboundReply;
use crate::queue::{Queue, DEFAULT_STALE_AFTER_MINUTES};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub requeued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivery {
    Sent,
    Deferred(DateTime<Utc>),
    Skipped(String),
    Failed(String),
}

/// Appends the first signature marker so the filter recognises the reply if
/// it ever comes back into the mailbox.
pub fn compose_body(reply: &str, signature: Option<&str>) -> String {
    match signature.map(str::trim).filter(|marker| !marker.is_empty()) {
        Some(marker) => format!("{}\n\n{}", reply.trim_end(), marker),
        None => reply.trim_end().to_string(),
    }
}

pub struct ReplySender<'p, 'a> {
    pipeline: &'p Pipeline<'a>,
}

impl<'p, 'a> ReplySender<'p, 'a> {
    pub fn new(pipeline: &'p Pipeline<'a>) -> Self {
        Self { pipeline }
    }

    /// Claims up to `max_items` due items and delivers each one. Items whose
    /// message has no record yet (enqueued from outside a fetch cycle) go
    /// through the full evaluation first, and wait in the queue when pacing
    /// or the quiet window puts their send time in the future.
    pub async fn drain(
        &self,
        max_items: usize,
        now: DateTime<Utc>,
    ) -> Result<DrainReport, PipelineError> {
        let db = self.pipeline.db();
        let queue = Queue::new(db);
        let mut report = DrainReport {
            requeued: queue.requeue_stale(now, Duration::minutes(DEFAULT_STALE_AFTER_MINUTES))?,
            ..DrainReport::default()
        };
        let mut tokens: HashMap<String, Result<String, String>> = HashMap::new();
        let mut cycle = CycleState::default();

        while report.claimed < max_items {
            let Some(item) = queue.claim_next(now)? else {
                break;
            };
            report.claimed += 1;

            match self.deliver(&item, now, &mut tokens, &mut cycle).await? {
                Delivery::Sent => {
                    queue.complete(item.id, now)?;
                    report.sent += 1;
                }
                Delivery::Deferred(send_after) => {
                    info!(
                        tenant_id = %item.tenant_id,
                        message_id = %item.payload.id,
                        send_after = %send_after,
                        "reply held until its send time"
                    );
                    report.deferred += 1;
                }
                Delivery::Skipped(reason) => {
                    info!(
                        tenant_id = %item.tenant_id,
                        message_id = %item.payload.id,
                        reason,
                        "queue item closed without sending"
                    );
                    queue.complete(item.id, now)?;
                    report.skipped += 1;
                }
                Delivery::Failed(error) => {
                    warn!(
                        tenant_id = %item.tenant_id,
                        message_id = %item.payload.id,
                        error,
                        "reply delivery failed"
                    );
                    queue.fail(item.id, &error, now)?;
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                skipped = report.skipped,
                failed = report.failed,
                deferred = report.deferred,
                "queue drained"
            );
        }
        Ok(report)
    }

    async fn deliver(
        &self,
        item: &QueueItem,
        now: DateTime<Utc>,
        tokens: &mut HashMap<String, Result<String, String>>,
        cycle: &mut CycleState,
    ) -> Result<Delivery, PipelineError> {
        let db = self.pipeline.db();
        let Some(tenant) = db.get_tenant(&item.tenant_id)? else {
            return Ok(Delivery::Failed(format!("tenant not found: {}", item.tenant_id)));
        };
        let message = &item.payload;

        let record = match db.get_processed(&tenant.tenant_id, &message.id, &tenant.mailbox_address)? {
            Some(record) => record,
            None => {
                let ctx = TenantContext::load(db, &tenant)?;
                let processed = db.processed_ids(&tenant.tenant_id, &tenant.mailbox_address)?;
                let outcome = self
                    .pipeline
                    .evaluate_message(&tenant, &ctx, message, &processed, cycle)
                    .await?;
                db.bump_tenant_counters(&tenant.tenant_id, 1, 0)?;
                match outcome {
                    MessageOutcome::Queued(queued) if queued.send_after > now => {
                        db.immediate(|_| {
                            db.upsert_processed(&queued.record)?;
                            db.defer_queue_item(item.id, queued.send_after, now)?;
                            Ok(())
                        })?;
                        return Ok(Delivery::Deferred(queued.send_after));
                    }
                    MessageOutcome::Queued(queued) => {
                        db.upsert_processed(&queued.record)?;
                        queued.record
                    }
                    MessageOutcome::Skipped(reason) => {
                        return Ok(Delivery::Skipped(reason.to_string()));
                    }
                }
            }
        };

        match record.status {
            RecordStatus::Queued => {}
            other => return Ok(Delivery::Skipped(format!("record already {other}"))),
        }
        if !tenant.active {
            return self.record_failure(&record, "tenant inactive".to_string(), now);
        }
        let Some(reply) = record
            .response_text
            .as_deref()
            .filter(|reply| !reply.trim().is_empty())
        else {
            return self.record_failure(&record, "no reply text drafted".to_string(), now);
        };
        let recipient = record
            .sender_address
            .clone()
            .filter(|sender| !sender.is_empty())
            .unwrap_or_else(|| message.sender().to_string());
        if recipient.is_empty() {
            return self.record_failure(&record, "no recipient address".to_string(), now);
        }

        let access_token = match self.token_for(&tenant, tokens).await {
            Ok(token) => token,
            Err(error) => return self.record_failure(&record, error, now),
        };

        let markers = self.pipeline.settings().signature_markers();
        let outbound = OutboundReply {
            message_id: message.id.clone(),
            recipient,
            body: compose_body(reply, markers.first().map(String::as_str)),
        };

        match self
            .pipeline
            .provider()
            .send_reply(&tenant.mailbox_address, &access_token, &outbound)
            .await
        {
            Ok(()) => {
                let sent = ProcessedRecord {
                    status: RecordStatus::Sent,
                    error_detail: None,
                    processed_at: timestamp(now),
                    ..record
                };
                db.upsert_processed(&sent)?;
                db.bump_tenant_counters(&tenant.tenant_id, 0, 1)?;
                info!(
                    tenant_id = %tenant.tenant_id,
                    message_id = %message.id,
                    "reply sent"
                );
                Ok(Delivery::Sent)
            }
            Err(error) => self.record_failure(&record, error.to_string(), now),
        }
    }

    /// One credential chain run per tenant per drain, success or not.
    async fn token_for(
        &self,
        tenant: &Tenant,
        tokens: &mut HashMap<String, Result<String, String>>,
    ) -> Result<String, String> {
        if let Some(cached) = tokens.get(&tenant.tenant_id) {
            return cached.clone();
        }
        let resolved = self
            .pipeline
            .credentials()
            .ensure_valid_token(tenant)
            .await
            .map(|token| token.value)
            .map_err(|error| error.to_string());
        tokens.insert(tenant.tenant_id.clone(), resolved.clone());
        resolved
    }

    fn record_failure(
        &self,
        record: &ProcessedRecord,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Delivery, PipelineError> {
        let failed = ProcessedRecord {
            status: RecordStatus::Failed,
            error_detail: Some(error.clone()),
            processed_at: timestamp(now),
            ..record.clone()
        };
        self.pipeline.db().upsert_processed(&failed)?;
        Ok(Delivery::Failed(error))
    }
}
