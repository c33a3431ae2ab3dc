//! Parsing of the classification collaborator's response.
//!
//! The collaborator is asked for a single JSON object. Responses are parsed in
//! three stages: code fences are stripped, the remainder is parsed strictly,
//! and failing that the first balanced `{...}` substring that parses is used.
//! Anything else is [`ParsedDecision::Malformed`], which maps to `continue`
//! with the raw text as the reply.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the dialogue should do with this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Ask one clarifying question
    Clarify,
    /// Requirements are clear; restate them and ask for confirmation
    Extract,
    /// The user affirmed; confirm the requirements
    StartGen,
    /// Not enough signal yet
    Continue,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::Extract => "extract",
            Self::StartGen => "start_gen",
            Self::Continue => "continue",
        }
    }

    /// Unknown actions fall back to `continue`.
    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "clarify" => Self::Clarify,
            "extract" => Self::Extract,
            "start_gen" | "start-gen" | "startgen" => Self::StartGen,
            _ => Self::Continue,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decision for one dialogue turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    /// Reply shown to the user
    pub response: String,
    /// Structured requirements, for `extract` and `start_gen`
    pub requirements: Option<String>,
    pub clarifying_questions: Vec<String>,
}

impl Decision {
    /// A `continue` decision replying with `text`.
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            action: Action::Continue,
            response: text.into(),
            requirements: None,
            clarifying_questions: Vec::new(),
        }
    }
}

/// Result of parsing a classification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedDecision {
    Parsed(Decision),
    Malformed { raw: String },
}

impl ParsedDecision {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// The decision to act on; malformed responses become `continue`.
    pub fn into_decision(self) -> Decision {
        match self {
            Self::Parsed(decision) => decision,
            Self::Malformed { raw } => Decision::reply(raw),
        }
    }
}

// Wire shape; every field is optional so partial objects still parse
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    requirements: Option<Value>,
    #[serde(default)]
    clarifying_questions: Option<Vec<String>>,
}

impl From<RawDecision> for Decision {
    fn from(raw: RawDecision) -> Self {
        Self {
            action: raw
                .action
                .as_deref()
                .map(Action::from_label)
                .unwrap_or(Action::Continue),
            response: raw.response.unwrap_or_default().trim().to_string(),
            requirements: raw
                .requirements
                .and_then(requirements_text)
                .filter(|r| !r.is_empty()),
            clarifying_questions: raw
                .clarifying_questions
                .unwrap_or_default()
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect(),
        }
    }
}

// Structured requirements are kept as compact JSON text
fn requirements_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"```(?:json|JSON)?[ \t]*").expect("valid regex"))
}

/// Remove markdown code fences around (or inside) the response.
pub fn strip_fences(raw: &str) -> String {
    fence_pattern().replace_all(raw, "").trim().to_string()
}

/// Parse a classification response. Never fails.
pub fn parse_decision(raw: &str) -> ParsedDecision {
    let content = strip_fences(raw);

    if let Ok(decision) = serde_json::from_str::<RawDecision>(&content) {
        return ParsedDecision::Parsed(decision.into());
    }

    for candidate in balanced_objects(&content) {
        if let Ok(decision) = serde_json::from_str::<RawDecision>(candidate) {
            return ParsedDecision::Parsed(decision.into());
        }
    }

    ParsedDecision::Malformed { raw: content }
}

/// Every balanced `{...}` substring, outermost first, in order of appearance.
///
/// Braces inside JSON string literals are ignored.
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();

    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &byte) in bytes[start..].iter().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        found.push(&text[start..=start + offset]);
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_json() {
        let raw = r#"{"action": "extract", "response": "Shall I build it?", "requirements": "A blog", "clarifying_questions": []}"#;
        let decision = parse_decision(raw).into_decision();
        assert_eq!(decision.action, Action::Extract);
        assert_eq!(decision.response, "Shall I build it?");
        assert_eq!(decision.requirements.as_deref(), Some("A blog"));
    }

    #[test]
    fn test_fenced_json() {
        let raw = "```json\n{\"action\": \"clarify\", \"response\": \"Who uses it?\", \"clarifying_questions\": [\"Who uses it?\"]}\n```";
        let decision = parse_decision(raw).into_decision();
        assert_eq!(decision.action, Action::Clarify);
        assert_eq!(decision.clarifying_questions, vec!["Who uses it?"]);
    }

    #[test]
    fn test_embedded_object() {
        let raw = "Sure! Here is my decision: {\"action\": \"start_gen\", \"response\": \"Starting {now}\", \"requirements\": \"A {simple} blog\"} Hope that helps.";
        let decision = parse_decision(raw).into_decision();
        assert_eq!(decision.action, Action::StartGen);
        assert_eq!(decision.response, "Starting {now}");
        assert_eq!(decision.requirements.as_deref(), Some("A {simple} blog"));
    }

    #[test]
    fn test_nested_braces_pick_outer_object() {
        let raw = "note {not json} then {\"action\": \"extract\", \"response\": \"ok\", \"meta\": {\"x\": 1}}";
        let decision = parse_decision(raw).into_decision();
        assert_eq!(decision.action, Action::Extract);
    }

    #[test]
    fn test_prose_is_malformed() {
        let parsed = parse_decision("I'd love to help! What kind of app do you have in mind?");
        assert!(parsed.is_malformed());

        let decision = parsed.into_decision();
        assert_eq!(decision.action, Action::Continue);
        assert_eq!(
            decision.response,
            "I'd love to help! What kind of app do you have in mind?"
        );
    }

    #[test]
    fn test_unknown_action_continues() {
        let decision = parse_decision(r#"{"action": "deploy", "response": "hm"}"#).into_decision();
        assert_eq!(decision.action, Action::Continue);
    }

    #[test]
    fn test_null_requirements() {
        let decision =
            parse_decision(r#"{"action": "continue", "response": "Tell me more", "requirements": null}"#)
                .into_decision();
        assert_eq!(decision.requirements, None);
    }

    #[test]
    fn test_structured_requirements_are_kept() {
        let raw = r#"{"action": "extract", "response": "Build it?", "requirements": {"pages": ["home"]}}"#;
        let parsed = parse_decision(raw);
        assert!(!parsed.is_malformed());

        let decision = parsed.into_decision();
        assert_eq!(decision.action, Action::Extract);
        assert_eq!(decision.response, "Build it?");
        assert_eq!(decision.requirements.as_deref(), Some(r#"{"pages":["home"]}"#));

        let raw = r#"{"action": "extract", "response": "ok", "requirements": ["todo list", "tags"]}"#;
        let decision = parse_decision(raw).into_decision();
        assert_eq!(decision.requirements.as_deref(), Some(r#"["todo list","tags"]"#));
    }

    #[test]
    fn test_empty_response_is_malformed() {
        assert_eq!(
            parse_decision("   "),
            ParsedDecision::Malformed { raw: String::new() }
        );
    }
}
