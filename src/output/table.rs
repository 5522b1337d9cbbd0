use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{ProcessedRecord, RecordStatus, Tenant};
use crate::guard::TierUsage;
use crate::output::StatusView;
use crate::pipeline::CycleReport;
use crate::sender::DrainReport;

const TENANT_WIDTH: usize = 16;
const MAILBOX_WIDTH: usize = 32;
const SENDER_WIDTH: usize = 28;
const SUBJECT_WIDTH: usize = 40;
const STATUS_WIDTH: usize = 8;
const DATE_WIDTH: usize = 12;
const DETAIL_WIDTH: usize = 36;

pub fn format_status(status: &StatusView) -> String {
    let stats = &status.database;
    let mut out = String::new();
    out.push_str("ARS Status\n");
    out.push_str("==========\n");
    out.push_str(&format!(
        "Tenants:   {} ({} active)\n",
        stats.total_tenants, stats.active_tenants
    ));
    out.push_str(&format!("Knowledge: {} documents\n", stats.knowledge_documents));

    if !stats.records_by_status.is_empty() {
        out.push('\n');
        out.push_str("Records by status\n");
        out.push_str("-----------------\n");
        for row in &stats.records_by_status {
            out.push_str(&format!("{:<12} {:>8}\n", row.status, row.count));
        }
    }
    if !stats.queue_by_status.is_empty() {
        out.push('\n');
        out.push_str("Queue by status\n");
        out.push_str("---------------\n");
        for row in &stats.queue_by_status {
            out.push_str(&format!("{:<12} {:>8}\n", row.status, row.count));
        }
    }

    for entry in &status.tenants {
        let limits = &entry.rate_limits;
        out.push('\n');
        out.push_str(&format!(
            "{} <{}>{}\n",
            entry.tenant.tenant_id,
            entry.tenant.mailbox_address,
            if entry.tenant.active { "" } else { "  [inactive]" }
        ));
        out.push_str(&format!(
            "  burst {}  minute {}  hour {}  day {}\n",
            usage(&limits.burst),
            usage(&limits.minute),
            usage(&limits.hour),
            usage(&limits.day)
        ));
        out.push_str(&format!(
            "  last send: {}  next send in: {}s\n",
            limits
                .last_sent_at
                .map(|at| relative_date(&at.to_rfc3339()))
                .unwrap_or_else(|| "never".to_string()),
            limits.next_send_in_secs
        ));
        out.push_str(&format!(
            "  queue: pending={} processing={} done={} error={}\n",
            entry.queue.pending, entry.queue.processing, entry.queue.done, entry.queue.error
        ));
        out.push_str(&format!(
            "  lifetime: processed={} replied={}  last checked: {}\n",
            entry.tenant.emails_processed,
            entry.tenant.emails_replied,
            entry
                .tenant
                .last_checked_at
                .as_deref()
                .map(relative_date)
                .unwrap_or_else(|| "never".to_string())
        ));
    }

    out
}

pub fn format_tenants(tenants: &[Tenant]) -> String {
    if tenants.is_empty() {
        return "No tenants configured.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<tenant$}  {:<mailbox$}  {:<6}  {:>9}  {:>7}  {}\n",
        "Tenant",
        "Mailbox",
        "Active",
        "Processed",
        "Replied",
        "Last Checked",
        tenant = TENANT_WIDTH,
        mailbox = MAILBOX_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}\n",
        "-".repeat(TENANT_WIDTH),
        "-".repeat(MAILBOX_WIDTH),
        "-".repeat(6),
        "-".repeat(9),
        "-".repeat(7),
        "-".repeat(DATE_WIDTH)
    ));

    for tenant in tenants {
        out.push_str(&format!(
            "{:<tenant$}  {:<mailbox$}  {:<6}  {:>9}  {:>7}  {}\n",
            truncate_for_width(&tenant.tenant_id, TENANT_WIDTH),
            truncate_for_width(&tenant.mailbox_address, MAILBOX_WIDTH),
            if tenant.active { "yes" } else { "no" },
            tenant.emails_processed,
            tenant.emails_replied,
            tenant
                .last_checked_at
                .as_deref()
                .map(relative_date)
                .unwrap_or_else(|| "never".to_string()),
            tenant = TENANT_WIDTH,
            mailbox = MAILBOX_WIDTH
        ));
    }

    out
}

pub fn format_records(records: &[ProcessedRecord]) -> String {
    if records.is_empty() {
        return "No processed messages.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<status$}  {:<sender$}  {:<subject$}  {:<date$}  {}\n",
        "Status",
        "Sender",
        "Subject",
        "When",
        "Detail",
        status = STATUS_WIDTH,
        sender = SENDER_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(STATUS_WIDTH),
        "-".repeat(SENDER_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(DETAIL_WIDTH)
    ));

    for record in records {
        let status = colorize_status(record.status, STATUS_WIDTH);
        let detail = record
            .error_detail
            .as_deref()
            .or_else(|| {
                record
                    .analysis
                    .as_ref()
                    .and_then(|analysis| analysis.get("category"))
                    .and_then(|category| category.as_str())
            })
            .unwrap_or("-");

        out.push_str(&format!(
            "{}  {:<sender$}  {:<subject$}  {:<date$}  {}\n",
            status,
            truncate_for_width(record.sender_address.as_deref().unwrap_or("(unknown)"), SENDER_WIDTH),
            truncate_for_width(record.subject.as_deref().unwrap_or("(no subject)"), SUBJECT_WIDTH),
            truncate_for_width(&relative_date(&record.processed_at), DATE_WIDTH),
            truncate_for_width(detail, DETAIL_WIDTH),
            sender = SENDER_WIDTH,
            subject = SUBJECT_WIDTH,
            date = DATE_WIDTH
        ));
    }

    out
}

pub fn format_cycle_report(report: &CycleReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Cycle {}: {} queued, {} skipped, {} tenant(s) failed\n",
        report.started_at,
        report.queued(),
        report.skipped(),
        report.failed_tenants()
    ));
    for tenant in &report.tenants {
        match &tenant.error {
            Some(error) => out.push_str(&format!("  {}: error: {error}\n", tenant.tenant_id)),
            None => out.push_str(&format!(
                "  {}: fetched={} queued={} skipped={} rate_limited={} duplicates={} model_calls={} fallbacks={}\n",
                tenant.tenant_id,
                tenant.fetched,
                tenant.queued,
                tenant.skipped,
                tenant.rate_limited,
                tenant.already_processed,
                tenant.model_calls,
                tenant.fallbacks
            )),
        }
    }
    out
}

pub fn format_drain_report(report: &DrainReport) -> String {
    format!(
        "Drain: claimed={} sent={} skipped={} failed={} deferred={} requeued={}",
        report.claimed,
        report.sent,
        report.skipped,
        report.failed,
        report.deferred,
        report.requeued
    )
}

fn usage(tier: &TierUsage) -> String {
    format!("{}/{}", tier.used, tier.limit)
}

fn colorize_status(status: RecordStatus, width: usize) -> String {
    let padded = format!("{:<width$}", status.as_str(), width = width);
    match status {
        RecordStatus::Sent => format!("\u{1b}[32m{padded}\u{1b}[0m"),
        RecordStatus::Failed => format!("\u{1b}[31m{padded}\u{1b}[0m"),
        RecordStatus::Queued => format!("\u{1b}[36m{padded}\u{1b}[0m"),
        RecordStatus::Skipped => format!("\u{1b}[33m{padded}\u{1b}[0m"),
    }
}

fn relative_date(input: &str) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = Utc::now().signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }
    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{format_drain_report, format_records, format_tenants, truncate_for_width};
    use crate::db::models::{ProcessedRecord, RecordStatus, Tenant};
    use crate::db::timestamp;
    use crate::sender::DrainReport;

    fn record(status: RecordStatus, detail: Option<&str>) -> ProcessedRecord {
        ProcessedRecord {
            tenant_id: "t-1".to_string(),
            message_id: "m-1".to_string(),
            connection_address: "office@example.edu".to_string(),
            status,
            sender_address: Some("student@example.com".to_string()),
            subject: Some("Une question très longue à propos des frais de scolarité pour l'année prochaine".to_string()),
            analysis: Some(json!({"category": "fees"})),
            response_text: None,
            error_detail: detail.map(str::to_string),
            processed_at: timestamp(Utc::now() - Duration::hours(3)),
        }
    }

    #[test]
    fn records_table_shows_reason_or_category() {
        let rendered = format_records(&[
            record(RecordStatus::Skipped, Some("rate_limited: per_hour: 15/15")),
            record(RecordStatus::Sent, None),
        ]);
        assert!(rendered.contains("Status"));
        assert!(rendered.contains("per_hour"));
        assert!(rendered.contains("fees"));
        assert!(rendered.contains("3h ago"));
        assert!(rendered.contains('…'));
    }

    #[test]
    fn empty_tables_say_so() {
        assert_eq!(format_records(&[]), "No processed messages.");
        assert_eq!(format_tenants(&[]), "No tenants configured.");
    }

    #[test]
    fn tenants_table_lists_mailboxes() {
        let rendered = format_tenants(&[Tenant::new("t-1", "office@example.edu")]);
        assert!(rendered.contains("office@example.edu"));
        assert!(rendered.contains("never"));
    }

    #[test]
    fn truncation_counts_display_width() {
        assert_eq!(truncate_for_width("abcdef", 4), "abc…");
        assert_eq!(truncate_for_width("abc", 4), "abc");
    }

    #[test]
    fn drain_report_is_one_line() {
        let rendered = format_drain_report(&DrainReport {
            claimed: 2,
            sent: 1,
            failed: 1,
            deferred: 1,
            ..DrainReport::default()
        });
        assert_eq!(
            rendered,
            "Drain: claimed=2 sent=1 skipped=0 failed=1 deferred=1 requeued=0"
        );
    }
}
