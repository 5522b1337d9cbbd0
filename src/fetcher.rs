use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::FetchSettings;
use crate::db::models::Tenant;
use crate::error::PipelineError;
use crate::provider::{MailProvider, ProviderError};

pub use crate::db::models::InboundMessage;

pub struct Fetcher<'a> {
    provider: &'a dyn MailProvider,
    settings: &'a FetchSettings,
}

impl<'a> Fetcher<'a> {
    pub fn new(provider: &'a dyn MailProvider, settings: &'a FetchSettings) -> Self {
        Self { provider, settings }
    }

    /// Lower bound for the next fetch. The overlap re-reads a few minutes that
    /// were already seen; the dedup filter absorbs the repeats.
    pub fn watermark_for(&self, tenant: &Tenant, now: DateTime<Utc>) -> DateTime<Utc> {
        match tenant.watermark() {
            None => now - Duration::hours(self.settings.first_run_lookback_hours),
            Some(watermark) => {
                (watermark - Duration::minutes(self.settings.overlap_minutes)).min(now)
            }
        }
    }

    /// Where the watermark moves once the cycle has checkpointed every message.
    /// A full batch may have left newer messages unread, so the watermark then
    /// stops at the newest message fetched (plus the overlap the next lower
    /// bound takes off again) rather than at the cycle start.
    pub fn next_watermark(
        &self,
        messages: &[InboundMessage],
        started: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if messages.is_empty() || messages.len() < self.settings.max_messages_per_cycle {
            return started;
        }
        match messages.iter().filter_map(InboundMessage::received).max() {
            Some(newest) => (newest + Duration::minutes(self.settings.overlap_minutes)).min(started),
            None => {
                warn!(
                    fetched = messages.len(),
                    "full batch without readable timestamps; watermark moves to cycle start"
                );
                started
            }
        }
    }

    pub async fn fetch_since(
        &self,
        tenant: &Tenant,
        access_token: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, PipelineError> {
        let messages = self
            .provider
            .list_messages_since(
                &tenant.mailbox_address,
                access_token,
                since,
                self.settings.max_messages_per_cycle,
            )
            .await
            .map_err(|error| match error {
                ProviderError::Unauthorized(detail) => PipelineError::ProviderUnavailable(format!(
                    "token rejected while listing messages: {detail}"
                )),
                other => PipelineError::ProviderUnavailable(other.to_string()),
            })?;

        debug!(
            tenant_id = %tenant.tenant_id,
            provider = self.provider.name(),
            since = %since,
            fetched = messages.len(),
            "fetched inbound messages"
        );
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Fetcher, InboundMessage};
    use crate::config::{FetchSettings, ProviderSettings};
    use crate::db::timestamp;
    use crate::db::models::Tenant;
    use crate::provider::GraphMailProvider;

    #[test]
    fn first_run_looks_back_one_day() {
        let provider = GraphMailProvider::new(&ProviderSettings::default());
        let settings = FetchSettings::default();
        let fetcher = Fetcher::new(&provider, &settings);
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();

        let tenant = Tenant::new("t-1", "office@example.edu");
        assert_eq!(fetcher.watermark_for(&tenant, now), now - Duration::hours(24));
    }

    #[test]
    fn later_runs_overlap_the_previous_watermark() {
        let provider = GraphMailProvider::new(&ProviderSettings::default());
        let settings = FetchSettings::default();
        let fetcher = Fetcher::new(&provider, &settings);
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();

        let mut tenant = Tenant::new("t-1", "office@example.edu");
        tenant.last_checked_at = Some(timestamp(now - Duration::minutes(10)));
        assert_eq!(
            fetcher.watermark_for(&tenant, now),
            now - Duration::minutes(15)
        );

        tenant.last_checked_at = Some(timestamp(now + Duration::hours(1)));
        assert_eq!(fetcher.watermark_for(&tenant, now), now);
    }

    fn received(id: usize, at: chrono::DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            id: format!("m-{id}"),
            subject: None,
            from_address: Some("applicant@example.com".to_string()),
            from_name: None,
            body_text: None,
            body_preview: None,
            received_at: timestamp(at),
            conversation_id: None,
        }
    }

    #[test]
    fn full_batch_holds_the_watermark_at_the_newest_message() {
        let provider = GraphMailProvider::new(&ProviderSettings::default());
        let settings = FetchSettings {
            max_messages_per_cycle: 3,
            ..FetchSettings::default()
        };
        let fetcher = Fetcher::new(&provider, &settings);
        let started = Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap();
        let first = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();

        let partial: Vec<_> = (0..2)
            .map(|i| received(i, first + Duration::seconds(i as i64)))
            .collect();
        assert_eq!(fetcher.next_watermark(&partial, started), started);
        assert_eq!(fetcher.next_watermark(&[], started), started);

        let full: Vec<_> = (0..3)
            .map(|i| received(i, first + Duration::seconds(i as i64)))
            .collect();
        let watermark = fetcher.next_watermark(&full, started);
        assert_eq!(watermark, first + Duration::seconds(2) + Duration::minutes(5));

        // The next lower bound starts at the newest message already seen.
        let mut tenant = Tenant::new("t-1", "office@example.edu");
        tenant.last_checked_at = Some(timestamp(watermark));
        assert_eq!(
            fetcher.watermark_for(&tenant, started),
            first + Duration::seconds(2)
        );
    }
}
