//! Last check on a verdict before it can become a queued reply. Repeats the
//! sender and subject checks of the filter so a verdict produced for an
//! externally enqueued message is held to the same rules.

use std::fmt::{Display, Formatter};

use tracing::debug;

use crate::ai::Analysis;
use crate::db::models::InboundMessage;
use crate::filter::{is_reply_loop, is_self_authored, is_system_sender};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyVeto {
    LowConfidence { confidence: f64, minimum: f64 },
    SystemSender,
    SelfAuthored,
    ReplyLoop,
    EmptyReply,
}

impl Display for PolicyVeto {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowConfidence {
                confidence,
                minimum,
            } => write!(f, "confidence {confidence:.2} below minimum {minimum:.2}"),
            Self::SystemSender => f.write_str("sender is a system address"),
            Self::SelfAuthored => f.write_str("sender is the tenant mailbox"),
            Self::ReplyLoop => f.write_str("subject indicates a reply loop"),
            Self::EmptyReply => f.write_str("reply text is empty"),
        }
    }
}

/// `None` when a positive verdict may stand. Negative verdicts are never
/// reviewed.
pub fn review(
    analysis: &Analysis,
    message: &InboundMessage,
    tenant_address: &str,
    min_confidence: f64,
) -> Option<PolicyVeto> {
    if !analysis.should_reply {
        return None;
    }

    let sender = message.sender();
    if analysis.confidence < min_confidence {
        return Some(PolicyVeto::LowConfidence {
            confidence: analysis.confidence,
            minimum: min_confidence,
        });
    }
    if sender.is_empty() || is_system_sender(sender) {
        return Some(PolicyVeto::SystemSender);
    }
    if is_self_authored(sender, tenant_address) {
        return Some(PolicyVeto::SelfAuthored);
    }
    if is_reply_loop(message.subject()) {
        return Some(PolicyVeto::ReplyLoop);
    }
    if analysis
        .reply
        .as_deref()
        .map_or(true, |reply| reply.trim().is_empty())
    {
        return Some(PolicyVeto::EmptyReply);
    }
    None
}

pub fn apply(
    mut analysis: Analysis,
    message: &InboundMessage,
    tenant_address: &str,
    min_confidence: f64,
) -> Analysis {
    if let Some(veto) = review(&analysis, message, tenant_address, min_confidence) {
        debug!(message_id = %message.id, %veto, "policy gate declined reply");
        analysis.should_reply = false;
        analysis.policy_note = Some(veto.to_string());
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::{apply, review, PolicyVeto};
    use crate::ai::{Analysis, AnalysisSource, Priority};
    use crate::db::models::InboundMessage;

    const OFFICE: &str = "office@example.edu";

    fn message(from: &str, subject: &str) -> InboundMessage {
        InboundMessage {
            id: "m-1".to_string(),
            subject: Some(subject.to_string()),
            from_address: Some(from.to_string()),
            from_name: None,
            body_text: Some("body".to_string()),
            body_preview: None,
            received_at: "2026-06-01T09:00:00Z".to_string(),
            conversation_id: None,
        }
    }

    fn verdict(confidence: f64, reply: Option<&str>) -> Analysis {
        Analysis {
            should_reply: true,
            priority: Priority::Medium,
            category: "general".to_string(),
            confidence,
            reply: reply.map(str::to_string),
            source: AnalysisSource::Model,
            policy_note: None,
        }
    }

    #[test]
    fn confident_reply_to_a_person_passes() {
        let analysis = apply(
            verdict(0.8, Some("Thanks!")),
            &message("student@example.com", "Question"),
            OFFICE,
            0.3,
        );
        assert!(analysis.should_reply);
        assert!(analysis.policy_note.is_none());
    }

    #[test]
    fn each_rule_vetoes() {
        let student = message("student@example.com", "Question");
        assert!(matches!(
            review(&verdict(0.29, Some("Hi")), &student, OFFICE, 0.3),
            Some(PolicyVeto::LowConfidence { .. })
        ));
        assert_eq!(
            review(
                &verdict(0.9, Some("Hi")),
                &message("MAILER-DAEMON@example.com", "Undeliverable"),
                OFFICE,
                0.3
            ),
            Some(PolicyVeto::SystemSender)
        );
        assert_eq!(
            review(&verdict(0.9, Some("Hi")), &message("Office@Example.edu", "Q"), OFFICE, 0.3),
            Some(PolicyVeto::SelfAuthored)
        );
        assert_eq!(
            review(
                &verdict(0.9, Some("Hi")),
                &message("student@example.com", "RE: re: Re: RE: fees"),
                OFFICE,
                0.3
            ),
            Some(PolicyVeto::ReplyLoop)
        );
        assert_eq!(
            review(&verdict(0.9, Some("  ")), &student, OFFICE, 0.3),
            Some(PolicyVeto::EmptyReply)
        );
    }

    #[test]
    fn declined_verdicts_are_left_alone() {
        let mut analysis = verdict(0.0, None);
        analysis.should_reply = false;
        let reviewed = apply(analysis.clone(), &message("", ""), OFFICE, 0.3);
        assert_eq!(reviewed, analysis);
    }
}
