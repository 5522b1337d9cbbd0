use crate::ai::TenantContext;
use crate::config::ModelSettings;
use crate::db::models::InboundMessage;

pub const DEFAULT_INSTRUCTIONS: &str = "You are the correspondence assistant for an education \
office. Decide whether the email below needs a reply from the office and, if it does, draft a \
short, polite and accurate answer. Only state facts that appear in the knowledge base. When the \
knowledge base does not cover the question, say that a staff member will follow up. Never reply \
to newsletters, automatic notifications, delivery failures or messages that need no answer.";

const OUTPUT_CONTRACT: &str = r#"Respond with JSON only, no prose and no markdown, exactly in this shape:
[{"shouldReply": true|false, "priority": "high"|"medium"|"low", "category": "admissions"|"scholarships"|"fees"|"visa"|"documents"|"general", "confidence": 0.0-1.0, "response": "reply text" or null}]"#;

const LANGUAGE_RULE: &str =
    "Write the reply in the same language as the incoming email.";

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn knowledge_section(ctx: &TenantContext, max_chars: usize) -> Option<String> {
    let mut combined = String::new();
    for document in &ctx.knowledge {
        let content = document.content.trim();
        if content.is_empty() {
            continue;
        }
        combined.push_str("### ");
        combined.push_str(document.title.trim());
        combined.push('\n');
        combined.push_str(content);
        combined.push_str("\n\n");
    }
    let combined = combined.trim_end();
    if combined.is_empty() {
        None
    } else {
        Some(truncate_chars(combined, max_chars).to_string())
    }
}

pub fn build_prompt(message: &InboundMessage, ctx: &TenantContext, settings: &ModelSettings) -> String {
    let instructions = ctx
        .custom_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or(DEFAULT_INSTRUCTIONS);

    let mut prompt = String::with_capacity(2_048);
    prompt.push_str(instructions);
    prompt.push_str("\n\n");

    if let Some(office) = ctx.display_name.as_deref() {
        prompt.push_str(&format!("You answer on behalf of: {office}\n\n"));
    }

    if let Some(knowledge) = knowledge_section(ctx, settings.max_knowledge_chars) {
        prompt.push_str("KNOWLEDGE BASE:\n");
        prompt.push_str(&knowledge);
        prompt.push_str("\n\n");
    }

    let sender = match message.from_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => format!("{name} <{}>", message.sender()),
        _ => message.sender().to_string(),
    };
    prompt.push_str("EMAIL:\n");
    prompt.push_str(&format!("Subject: {}\n", message.subject().trim()));
    prompt.push_str(&format!("From: {sender}\n"));
    prompt.push_str("Body:\n");
    prompt.push_str(truncate_chars(message.body().trim(), settings.max_body_chars));
    prompt.push_str("\n\n");

    prompt.push_str(LANGUAGE_RULE);
    prompt.push('\n');
    prompt.push_str(OUTPUT_CONTRACT);
    prompt
}
