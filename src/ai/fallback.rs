//! Keyword-based analysis used when the model path is unavailable.

use crate::ai::{Analysis, AnalysisSource, Priority};
use crate::db::models::InboundMessage;
use crate::filter::{is_self_authored, is_system_sender};

pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Checked in order; the first category with a matching keyword wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "visa",
        &["visa", "residence permit", "study permit", "embassy", "immigration"],
    ),
    (
        "scholarships",
        &["scholarship", "bursary", "financial aid", "funding", "grant"],
    ),
    (
        "fees",
        &["tuition", "fee", "payment", "invoice", "refund", "installment"],
    ),
    (
        "documents",
        &["transcript", "certificate", "document", "diploma", "recommendation letter"],
    ),
    (
        "admissions",
        &["admission", "apply", "application", "enrol", "enroll", "deadline", "requirement"],
    ),
];

/// Subjects and bodies of automated mail that never gets an answer.
const NO_REPLY_PATTERNS: &[&str] = &[
    "welcome to",
    "verify your email",
    "confirm your email",
    "confirm your subscription",
    "unsubscribe",
    "newsletter",
    "out of office",
    "automatic reply",
    "delivery status notification",
];

pub fn infer_category(subject: &str, body: &str) -> &'static str {
    let haystack = format!("{} {}", subject, body).to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| haystack.contains(keyword)))
        .map(|(category, _)| *category)
        .unwrap_or("general")
}

pub fn category_priority(category: &str) -> Priority {
    match category {
        "visa" | "admissions" => Priority::High,
        "fees" | "scholarships" | "documents" => Priority::Medium,
        _ => Priority::Low,
    }
}

pub fn is_no_reply_pattern(message: &InboundMessage) -> bool {
    let haystack = format!("{} {}", message.subject(), message.body()).to_lowercase();
    NO_REPLY_PATTERNS
        .iter()
        .any(|pattern| haystack.contains(pattern))
}

pub fn template_reply(category: &str, sender_name: Option<&str>) -> String {
    let greeting = match sender_name.map(str::trim) {
        Some(name) if !name.is_empty() => format!("Dear {name},"),
        _ => "Hello,".to_string(),
    };
    let topic = match category {
        "visa" => "Thank you for your question about visa and immigration matters. Our international office will review your case and send you the exact requirements shortly.",
        "scholarships" => "Thank you for your interest in our scholarships and financial aid. A member of the funding team will reply with the options that match your profile.",
        "fees" => "Thank you for your question about tuition and fees. Our finance team will confirm the amounts and payment options that apply to you.",
        "documents" => "Thank you for your message about your documents. We will check our records and let you know if anything else is needed.",
        "admissions" => "Thank you for your interest in studying with us. Our admissions team will get back to you with the requirements and deadlines for your programme.",
        _ => "Thank you for contacting us. Your message has been received and a member of our team will get back to you as soon as possible.",
    };
    format!("{greeting}\n\n{topic}\n\nKind regards")
}

pub fn analyze(message: &InboundMessage, tenant_address: &str) -> Analysis {
    let category = infer_category(message.subject(), message.body());
    let sender = message.sender();
    let declined = sender.is_empty()
        || is_system_sender(sender)
        || is_self_authored(sender, tenant_address)
        || is_no_reply_pattern(message);

    if declined {
        return Analysis {
            should_reply: false,
            priority: Priority::Low,
            category: category.to_string(),
            confidence: FALLBACK_CONFIDENCE,
            reply: None,
            source: AnalysisSource::Fallback,
            policy_note: None,
        };
    }

    Analysis {
        should_reply: true,
        priority: category_priority(category),
        category: category.to_string(),
        confidence: FALLBACK_CONFIDENCE,
        reply: Some(template_reply(category, message.from_name.as_deref())),
        source: AnalysisSource::Fallback,
        policy_note: None,
    }
}

#[cfg(test)]
mod tests {
    use super::{analyze, infer_category, FALLBACK_CONFIDENCE};
    use crate::ai::{AnalysisSource, Priority};
    use crate::db::models::InboundMessage;

    fn message(from: &str, subject: &str, body: &str) -> InboundMessage {
        InboundMessage {
            id: "m-1".to_string(),
            subject: Some(subject.to_string()),
            from_address: Some(from.to_string()),
            from_name: Some("Jordan".to_string()),
            body_text: Some(body.to_string()),
            body_preview: None,
            received_at: "2026-06-01T09:00:00Z".to_string(),
            conversation_id: None,
        }
    }

    #[test]
    fn categories_follow_keyword_order() {
        assert_eq!(infer_category("Visa appointment", "about my tuition"), "visa");
        assert_eq!(infer_category("Question", "Is there a scholarship?"), "scholarships");
        assert_eq!(infer_category("Invoice", ""), "fees");
        assert_eq!(infer_category("My transcript", ""), "documents");
        assert_eq!(infer_category("How do I apply", ""), "admissions");
        assert_eq!(infer_category("Hello", "just saying hi"), "general");
    }

    #[test]
    fn ordinary_questions_get_a_templated_reply() {
        let analysis = analyze(
            &message("jordan@example.com", "Admission requirements", "What do I need?"),
            "office@example.edu",
        );
        assert!(analysis.should_reply);
        assert_eq!(analysis.priority, Priority::High);
        assert_eq!(analysis.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(analysis.source, AnalysisSource::Fallback);
        let reply = analysis.reply.expect("reply");
        assert!(reply.starts_with("Dear Jordan,"));
        assert!(reply.contains("admissions team"));
    }

    #[test]
    fn system_and_welcome_mail_is_never_answered() {
        for candidate in [
            message("no-reply@portal.example.com", "Admission update", "hi"),
            message("jordan@example.com", "Welcome to the applicant portal", "hi"),
            message("office@example.edu", "Fees", "hi"),
        ] {
            let analysis = analyze(&candidate, "office@example.edu");
            assert!(!analysis.should_reply, "{:?}", candidate.subject);
            assert!(analysis.reply.is_none());
        }
    }
}
