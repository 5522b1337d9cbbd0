//! Decoding of model output. Each pass is a pure `&str -> String` transform
//! that never fails; [`parse_verdicts`] tries a parse after each one and stops
//! at the first success.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::ai::{Analysis, AnalysisSource, Priority};

type Pass = fn(&str) -> String;

/// Normalisations applied cumulatively, in order.
const CLEANING_PASSES: &[(&str, Pass)] = &[
    ("strip_fences", strip_fences),
    ("strip_control_chars", strip_control_chars),
    ("extract_json_region", extract_json_region),
];

/// Targeted repairs, each applied to the cleaned text.
const REPAIR_PASSES: &[(&str, Pass)] = &[
    ("escape_inner_quotes", escape_inner_quotes),
    ("balance_brackets", balance_brackets),
    ("escape_inner_quotes+balance_brackets", escape_then_balance),
];

/// One verdict as the model emits it. Field names follow the prompt contract;
/// snake_case spellings are tolerated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVerdict {
    #[serde(rename = "shouldReply", alias = "should_reply", deserialize_with = "lenient_bool")]
    pub should_reply: bool,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: Option<f64>,
    #[serde(default, alias = "reply")]
    pub response: Option<String>,
}

impl ModelVerdict {
    /// A verdict without a confidence is treated as zero confidence.
    pub fn into_analysis(self) -> Analysis {
        let category = self
            .category
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "general".to_string());
        let reply = self
            .response
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Analysis {
            should_reply: self.should_reply,
            priority: Priority::parse_lenient(self.priority.as_deref()),
            category,
            confidence: self.confidence.unwrap_or(0.0),
            reply,
            source: AnalysisSource::Model,
            policy_note: None,
        }
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(value) => Ok(value),
        Value::String(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "shouldReply is not a boolean: {other}"
            ))),
        },
        other => Err(serde::de::Error::custom(format!(
            "shouldReply is not a boolean: {other}"
        ))),
    }
}

/// Accepts `0.8`, `"0.8"`, `80` and `"80%"`, normalised to `[0, 1]`.
fn lenient_confidence<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<f64>, D::Error> {
    let raw = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(raw.filter(|value| value.is_finite()).map(|value| {
        let value = if value > 1.0 && value <= 100.0 {
            value / 100.0
        } else {
            value
        };
        value.clamp(0.0, 1.0)
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairFailure {
    /// Last pass whose output was tried.
    pub pass: &'static str,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl Display for RepairFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {}) after {}",
            self.message, self.line, self.column, self.pass
        )
    }
}

impl std::error::Error for RepairFailure {}

pub fn strip_fences(input: &str) -> String {
    let trimmed = input.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    // Drop the language tag on the fence line.
    let body_start = after_open.find('\n').map_or(after_open.len(), |idx| idx + 1);
    let body = &after_open[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim().to_string()
}

/// Drops control characters. Inside string literals, raw newlines and tabs
/// become escapes so the literal stays valid JSON.
pub fn strip_control_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if ch == '\u{feff}' {
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
                if !ch.is_control() {
                    out.push(ch);
                }
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => {}
                c => out.push(c),
            }
        } else {
            match ch {
                '"' => {
                    in_string = true;
                    out.push(ch);
                }
                '\n' | '\r' | '\t' => out.push(ch),
                c if c.is_control() => {}
                c => out.push(c),
            }
        }
    }
    out
}

/// Cuts leading and trailing prose around the outermost JSON value.
pub fn extract_json_region(input: &str) -> String {
    let Some(start) = input.find(['[', '{']) else {
        return input.trim().to_string();
    };
    let closer = if input[start..].starts_with('[') {
        ']'
    } else {
        '}'
    };
    match input.rfind(closer) {
        Some(end) if end > start => input[start..=end].to_string(),
        _ => input[start..].trim_end().to_string(),
    }
}

/// A quote inside a string is treated as closing only when the next
/// non-whitespace character could follow a JSON string.
pub fn escape_inner_quotes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &ch) in chars.iter().enumerate() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, None | Some(',') | Some('}') | Some(']') | Some(':')) {
                    in_string = false;
                    out.push(ch);
                } else {
                    out.push_str("\\\"");
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Closes a truncated document. A truncated top-level array is cut back to
/// its last complete element; anything else gets its open string and
/// brackets closed.
pub fn balance_brackets(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_complete_element: Option<usize> = None;

    for (idx, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => stack.push(ch),
            ']' | '}' => {
                stack.pop();
                if stack.len() == 1 && stack[0] == '[' {
                    last_complete_element = Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return input.to_string();
    }

    let element_open = stack.len() > 1 || in_string;
    if stack.first() == Some(&'[') && element_open {
        if let Some(end) = last_complete_element {
            let kept = input[..end].trim_end().trim_end_matches(',');
            return format!("{kept}]");
        }
    }

    let mut out = input.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    let trimmed_len = out.trim_end().trim_end_matches(',').len();
    out.truncate(trimmed_len);
    for opener in stack.iter().rev() {
        out.push(if *opener == '[' { ']' } else { '}' });
    }
    out
}

fn escape_then_balance(input: &str) -> String {
    balance_brackets(&escape_inner_quotes(input))
}

struct ParseIssue {
    line: usize,
    column: usize,
    message: String,
}

fn decode(candidate: &str) -> Result<Vec<ModelVerdict>, ParseIssue> {
    let value: Value = serde_json::from_str(candidate).map_err(|e| ParseIssue {
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })?;

    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(ParseIssue {
                line: 0,
                column: 0,
                message: format!("expected an array or object, got {other}"),
            })
        }
    };
    if items.is_empty() {
        return Err(ParseIssue {
            line: 0,
            column: 0,
            message: "verdict array is empty".to_string(),
        });
    }

    items
        .into_iter()
        .map(serde_json::from_value::<ModelVerdict>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ParseIssue {
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })
}

/// Parses either the batch form (`[{...}, ...]`) or a single verdict object.
pub fn parse_verdicts(raw: &str) -> Result<Vec<ModelVerdict>, RepairFailure> {
    let mut attempts: Vec<(&'static str, String)> = vec![("direct", raw.to_string())];
    let mut cleaned = raw.to_string();
    for &(name, pass) in CLEANING_PASSES {
        cleaned = pass(&cleaned);
        attempts.push((name, cleaned.clone()));
    }
    for &(name, pass) in REPAIR_PASSES {
        attempts.push((name, pass(&cleaned)));
    }

    let mut tried: Vec<&str> = Vec::new();
    let mut failure = None;
    for (pass, candidate) in &attempts {
        if tried.contains(&candidate.as_str()) {
            continue;
        }
        tried.push(candidate.as_str());

        match decode(candidate) {
            Ok(verdicts) => {
                if *pass != "direct" {
                    debug!(pass, "model output parsed after repair");
                }
                return Ok(verdicts);
            }
            Err(issue) => {
                debug!(
                    pass,
                    line = issue.line,
                    column = issue.column,
                    error = %issue.message,
                    "model output parse attempt failed"
                );
                failure = Some(RepairFailure {
                    pass: *pass,
                    line: issue.line,
                    column: issue.column,
                    message: issue.message,
                });
            }
        }
    }

    Err(failure.unwrap_or(RepairFailure {
        pass: "direct",
        line: 0,
        column: 0,
        message: "no parse attempted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::{
        balance_brackets, escape_inner_quotes, extract_json_region, parse_verdicts,
        strip_control_chars, strip_fences,
    };
    use crate::ai::{AnalysisSource, Priority};

    #[test]
    fn fences_and_language_tags_are_removed() {
        assert_eq!(strip_fences("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_fences("Here you go:\n```\n{}\n```\nThanks"), "{}");
        assert_eq!(strip_fences("  [true]  "), "[true]");
    }

    #[test]
    fn raw_newlines_inside_strings_become_escapes() {
        let input = "{\"response\": \"line one\nline two\u{7}\"}\n";
        assert_eq!(
            strip_control_chars(input),
            "{\"response\": \"line one\\nline two\"}\n"
        );
    }

    #[test]
    fn surrounding_prose_is_cut() {
        assert_eq!(
            extract_json_region("Sure! [{\"a\": 1}] hope this helps"),
            "[{\"a\": 1}]"
        );
        assert_eq!(extract_json_region("no json here"), "no json here");
    }

    #[test]
    fn stray_quotes_inside_values_are_escaped() {
        let input = r#"{"response": "We call it "the annex" on campus", "ok": true}"#;
        let repaired = escape_inner_quotes(input);
        let value: serde_json::Value = serde_json::from_str(&repaired).expect("valid after repair");
        assert_eq!(value["response"], "We call it \"the annex\" on campus");
    }

    #[test]
    fn truncated_arrays_keep_complete_elements() {
        let input = r#"[{"shouldReply": true, "confidence": 0.8}, {"shouldReply": false, "respo"#;
        assert_eq!(
            balance_brackets(input),
            r#"[{"shouldReply": true, "confidence": 0.8}]"#
        );
        assert_eq!(balance_brackets(r#"{"a": [1, 2"#), r#"{"a": [1, 2]}"#);
        assert_eq!(balance_brackets(r#"{"a": "cut"#), r#"{"a": "cut"}"#);
        assert_eq!(balance_brackets("[1, 2]"), "[1, 2]");
    }

    #[test]
    fn fenced_batch_output_parses() {
        let raw = "```json\n[{\"shouldReply\": true, \"priority\": \"high\", \"category\": \"Admissions\", \"confidence\": 0.92, \"response\": \"Welcome aboard\"}]\n```";
        let verdicts = parse_verdicts(raw).expect("parse");
        assert_eq!(verdicts.len(), 1);
        let analysis = verdicts[0].clone().into_analysis();
        assert!(analysis.should_reply);
        assert_eq!(analysis.priority, Priority::High);
        assert_eq!(analysis.category, "admissions");
        assert_eq!(analysis.source, AnalysisSource::Model);
    }

    #[test]
    fn singular_object_with_lenient_fields_parses() {
        let raw = r#"{"should_reply": "yes", "confidence": "85%", "reply": "  Hi  "}"#;
        let verdicts = parse_verdicts(raw).expect("parse");
        let analysis = verdicts[0].clone().into_analysis();
        assert!(analysis.should_reply);
        assert!((analysis.confidence - 0.85).abs() < 1e-9);
        assert_eq!(analysis.reply.as_deref(), Some("Hi"));
        assert_eq!(analysis.priority, Priority::Medium);
        assert_eq!(analysis.category, "general");
    }

    #[test]
    fn quote_and_truncation_damage_together_is_repaired() {
        let raw = "```json\n[{\"shouldReply\": true, \"confidence\": 0.7, \"response\": \"See the \"Fees\" page\"}, {\"shouldReply\": tr";
        let verdicts = parse_verdicts(raw).expect("repaired");
        assert_eq!(verdicts.len(), 1);
        assert_eq!(
            verdicts[0].response.as_deref(),
            Some("See the \"Fees\" page")
        );
    }

    #[test]
    fn hopeless_output_reports_position() {
        let failure = parse_verdicts("{\"shouldReply\": maybe}").expect_err("unparseable");
        assert_eq!(failure.line, 1);
        assert!(failure.column > 0);
        assert!(parse_verdicts("[]").is_err());
        assert!(parse_verdicts("").is_err());
    }
}
