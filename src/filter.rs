//! Pure accept/reject predicate applied to every fetched message before it can
//! reach the rate limiter.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::db::models::InboundMessage;

pub const MAX_REPLY_PREFIXES: usize = 3;

/// Local parts and display fragments of provider/system senders.
const SYSTEM_SENDER_PATTERNS: &[&str] = &[
    "mailer-daemon",
    "postmaster",
    "no-reply",
    "noreply",
    "do-not-reply",
    "donotreply",
    "microsoftexchange",
    "microsoft-noreply",
    "msonlineservicesteam",
    "notifications@",
    "bounce",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyProcessed,
    DuplicateInBatch,
    SelfAuthored,
    SystemSender,
    MissingSender,
    ReplyLoop,
    OwnSignature,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already_processed",
            Self::DuplicateInBatch => "duplicate_in_batch",
            Self::SelfAuthored => "self_authored",
            Self::SystemSender => "system_sender",
            Self::MissingSender => "missing_sender",
            Self::ReplyLoop => "reply_loop",
            Self::OwnSignature => "own_signature",
        }
    }

    /// Reasons worth a `skipped` record. Already-processed messages have one.
    pub fn records_outcome(self) -> bool {
        !matches!(self, Self::AlreadyProcessed | Self::DuplicateInBatch)
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    Reject(RejectReason),
}

pub struct FilterContext<'a> {
    pub tenant_address: &'a str,
    pub processed_ids: &'a HashSet<String>,
    /// Lowercased markers appended to our own replies.
    pub signature_markers: &'a [String],
}

/// The run of reply and forward prefixes a subject starts with.
fn prefix_chain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:(?:re|fwd?)\s*(?:\[\d+\])?\s*:\s*)+")
            .expect("compile prefix chain regex")
    })
}

fn reply_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bre\s*(?:\[\d+\])?\s*:").expect("compile reply prefix regex")
    })
}

/// `re:` prefixes in the leading chain only; "re:" later in the subject is
/// ordinary text.
pub fn reply_prefix_count(subject: &str) -> usize {
    prefix_chain_pattern()
        .find(subject)
        .map_or(0, |chain| reply_prefix_pattern().find_iter(chain.as_str()).count())
}

pub fn is_reply_loop(subject: &str) -> bool {
    reply_prefix_count(subject) > MAX_REPLY_PREFIXES
}

pub fn is_system_sender(sender: &str) -> bool {
    let lowered = sender.trim().to_ascii_lowercase();
    SYSTEM_SENDER_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

pub fn is_self_authored(sender: &str, tenant_address: &str) -> bool {
    let sender = sender.trim();
    !sender.is_empty() && sender.eq_ignore_ascii_case(tenant_address.trim())
}

pub fn carries_signature(body: &str, markers: &[String]) -> bool {
    let lowered = body.to_lowercase();
    markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .any(|marker| lowered.contains(marker.as_str()))
}

pub fn evaluate(message: &InboundMessage, ctx: &FilterContext<'_>) -> FilterVerdict {
    if ctx.processed_ids.contains(&message.id) {
        return FilterVerdict::Reject(RejectReason::AlreadyProcessed);
    }

    let sender = message.sender();
    if sender.is_empty() {
        return FilterVerdict::Reject(RejectReason::MissingSender);
    }
    if is_self_authored(sender, ctx.tenant_address) {
        return FilterVerdict::Reject(RejectReason::SelfAuthored);
    }
    if is_system_sender(sender) {
        return FilterVerdict::Reject(RejectReason::SystemSender);
    }
    if is_reply_loop(message.subject()) {
        return FilterVerdict::Reject(RejectReason::ReplyLoop);
    }
    if carries_signature(message.body(), ctx.signature_markers) {
        return FilterVerdict::Reject(RejectReason::OwnSignature);
    }

    FilterVerdict::Accept
}

/// Splits a fetched batch, keeping provider order within each side. A message
/// id seen earlier in the same batch is rejected as a duplicate.
pub fn partition(
    messages: Vec<InboundMessage>,
    ctx: &FilterContext<'_>,
) -> (Vec<InboundMessage>, Vec<(InboundMessage, RejectReason)>) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for message in messages {
        if !seen.insert(message.id.clone()) {
            rejected.push((message, RejectReason::DuplicateInBatch));
            continue;
        }
        match evaluate(&message, ctx) {
            FilterVerdict::Accept => accepted.push(message),
            FilterVerdict::Reject(reason) => rejected.push((message, reason)),
        }
    }

    (accepted, rejected)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        evaluate, is_reply_loop, partition, reply_prefix_count, FilterContext, FilterVerdict,
        RejectReason,
    };
    use crate::db::models::InboundMessage;

    fn message(id: &str, from: &str, subject: &str, body: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            subject: Some(subject.to_string()),
            from_address: Some(from.to_string()),
            from_name: None,
            body_text: Some(body.to_string()),
            body_preview: None,
            received_at: "2026-05-01T10:00:00Z".to_string(),
            conversation_id: None,
        }
    }

    fn markers() -> Vec<String> {
        vec!["[ars-auto-reply]".to_string()]
    }

    #[test]
    fn reply_prefixes_are_counted_case_insensitively() {
        assert_eq!(reply_prefix_count("Re: RE: re:Fees"), 3);
        assert_eq!(reply_prefix_count("Share: your thoughts"), 0);
        assert_eq!(reply_prefix_count("Are: you there"), 0);
        assert_eq!(reply_prefix_count("Fwd: Re: RE: Fw: re:re: Fees"), 4);
        assert_eq!(reply_prefix_count("Re: Question re: fees re: visa re: docs"), 1);
    }

    #[test]
    fn inline_re_in_a_subject_is_not_a_loop() {
        assert!(!is_reply_loop("Question re: fees re: visa re: docs re: housing"));
        assert!(is_reply_loop("RE: Re: re: Re[2]: Fees"));
    }

    #[test]
    fn each_rejection_reason_is_reported() {
        let processed: HashSet<String> = ["m-old".to_string()].into_iter().collect();
        let markers = markers();
        let ctx = FilterContext {
            tenant_address: "Office@Example.edu",
            processed_ids: &processed,
            signature_markers: &markers,
        };

        let cases = [
            (
                message("m-old", "student@example.com", "Fees", "hi"),
                FilterVerdict::Reject(RejectReason::AlreadyProcessed),
            ),
            (
                message("m-1", "office@example.edu", "Fees", "hi"),
                FilterVerdict::Reject(RejectReason::SelfAuthored),
            ),
            (
                message("m-2", "MAILER-DAEMON@example.com", "Undeliverable", "bounce"),
                FilterVerdict::Reject(RejectReason::SystemSender),
            ),
            (
                message("m-3", "student@example.com", "RE: Re: re: RE: Fees", "hi"),
                FilterVerdict::Reject(RejectReason::ReplyLoop),
            ),
            (
                message("m-4", "student@example.com", "Fees", "thanks\n[ARS-AUTO-REPLY]"),
                FilterVerdict::Reject(RejectReason::OwnSignature),
            ),
            (
                message("m-5", "  ", "Fees", "hi"),
                FilterVerdict::Reject(RejectReason::MissingSender),
            ),
            (
                message("m-6", "student@example.com", "Re: Re: Re: Fees", "When?"),
                FilterVerdict::Accept,
            ),
        ];

        for (candidate, expected) in cases {
            assert_eq!(evaluate(&candidate, &ctx), expected, "message {}", candidate.id);
        }
    }

    #[test]
    fn partition_drops_in_batch_duplicates_and_keeps_order() {
        let processed = HashSet::new();
        let markers = markers();
        let ctx = FilterContext {
            tenant_address: "office@example.edu",
            processed_ids: &processed,
            signature_markers: &markers,
        };

        let batch = vec![
            message("m-1", "a@example.com", "One", "hi"),
            message("m-2", "b@example.com", "Two", "hi"),
            message("m-1", "a@example.com", "One", "hi"),
            message("m-3", "office@example.edu", "Three", "hi"),
        ];
        let (accepted, rejected) = partition(batch, &ctx);

        let ids: Vec<_> = accepted.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].1, RejectReason::DuplicateInBatch);
        assert_eq!(rejected[1].1, RejectReason::SelfAuthored);
    }
}
