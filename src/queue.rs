//! Durable hand-off between the fetch cycle and the reply worker.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai::Priority;
use crate::db::models::{InboundMessage, QueueItem, QueueStatus};
use crate::db::{Database, DbError};

/// Items left in `processing` longer than this are assumed abandoned.
pub const DEFAULT_STALE_AFTER_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub error: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.done + self.error
    }
}

pub struct Queue<'a> {
    db: &'a Database,
}

impl<'a> Queue<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn enqueue(
        &self,
        tenant_id: &str,
        message: &InboundMessage,
        priority: Priority,
        now: DateTime<Utc>,
        send_after: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let id = self
            .db
            .insert_queue_item(tenant_id, message, priority.rank(), now, send_after)?;
        debug!(
            tenant_id,
            message_id = %message.id,
            queue_item_id = id,
            %priority,
            send_after = %send_after,
            "queued reply"
        );
        Ok(id)
    }

    /// Highest priority first, then oldest. Items whose `send_after` is still
    /// in the future are left alone.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, DbError> {
        self.db.claim_queue_item(now)
    }

    pub fn complete(&self, id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        self.db.set_queue_status(id, QueueStatus::Done, None, now)?;
        Ok(())
    }

    pub fn fail(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        self.db
            .set_queue_status(id, QueueStatus::Error, Some(error), now)?;
        Ok(())
    }

    pub fn requeue_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<usize, DbError> {
        let requeued = self.db.requeue_stale_items(now - stale_after, now)?;
        if requeued > 0 {
            warn!(requeued, "returned abandoned queue items to pending");
        }
        Ok(requeued)
    }

    /// Returns a claimed item to `pending` until its pacing delay has passed.
    pub fn defer(&self, id: i64, send_after: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), DbError> {
        self.db.defer_queue_item(id, send_after, now)?;
        debug!(queue_item_id = id, send_after = %send_after, "queue item deferred");
        Ok(())
    }

    pub fn stats(&self, tenant_id: &str) -> Result<QueueStats, DbError> {
        let mut stats = QueueStats::default();
        for (status, count) in self.db.count_queue_items_by_status(tenant_id)? {
            match status {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Done => stats.done = count,
                QueueStatus::Error => stats.error = count,
            }
        }
        Ok(stats)
    }
}

/// Wakes the reply worker after an enqueue. Never fails the caller: the queue
/// is durable and the next drain picks up anything a lost signal missed.
pub trait WorkerSignal {
    fn notify(&self, tenant_id: &str, queue_item_id: i64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSignal;

impl WorkerSignal for NoopSignal {
    fn notify(&self, tenant_id: &str, queue_item_id: i64) {
        debug!(tenant_id, queue_item_id, "no worker URL configured; item waits for the next drain");
    }
}

#[derive(Debug, Serialize)]
struct SignalPayload<'a> {
    tenant_id: &'a str,
    queue_item_id: i64,
}

#[derive(Debug, Clone)]
pub struct HttpWorkerSignal {
    client: Client,
    url: String,
}

impl HttpWorkerSignal {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }
}

impl WorkerSignal for HttpWorkerSignal {
    fn notify(&self, tenant_id: &str, queue_item_id: i64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(tenant_id, queue_item_id, "no async runtime; worker signal dropped");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let body = match serde_json::to_value(SignalPayload {
            tenant_id,
            queue_item_id,
        }) {
            Ok(body) => body,
            Err(error) => {
                warn!(tenant_id, queue_item_id, %error, "worker signal payload not encodable");
                return;
            }
        };
        let tenant_id = tenant_id.to_string();

        runtime.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(tenant_id, queue_item_id, "worker signalled");
                }
                Ok(response) => {
                    warn!(tenant_id, queue_item_id, status = %response.status(), "worker signal rejected");
                }
                Err(error) => {
                    warn!(tenant_id, queue_item_id, %error, "worker signal failed");
                }
            }
        });
    }
}

pub fn signal_for(worker_url: Option<&str>) -> Box<dyn WorkerSignal> {
    match worker_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => Box::new(HttpWorkerSignal::new(url)),
        None => Box::new(NoopSignal),
    }
}
