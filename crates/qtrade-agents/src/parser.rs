use std::collections::BTreeMap;

use qtrade_models::score::Score;
use qtrade_models::trade_decision::Action;
use serde::{Deserialize, Deserializer};

use crate::error::AgentError;

/// Candidate JSON objects in command output, most specific first: the whole
/// trimmed text, then the body of each fenced code block, then every balanced
/// top-level `{ ... }` span in order of appearance.
fn candidates(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    let mut found = vec![trimmed];
    found.extend(fenced_blocks(trimmed));
    found.extend(object_spans(trimmed));
    found
}

/// Bodies of markdown fences, with or without a language tag.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(newline) = after.find('\n') else {
            break;
        };
        let body = &after[newline + 1..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(body[..close].trim());
        rest = &body[close + 3..];
    }
    blocks
}

/// Balanced top-level object spans. Braces inside string literals are ignored.
fn object_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut open = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    open = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[open..=i]);
                }
            }
            _ => {}
        }
    }
    spans
}

/// Reply printed by a command agent on stdout.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommandReply {
    #[serde(deserialize_with = "action_any_case")]
    pub action: Action,
    /// Either a 0.0-1.0 fraction or a 0-100 score.
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub findings: BTreeMap<String, serde_json::Value>,
}

impl CommandReply {
    pub fn score(&self) -> Score {
        Score::from_f64_lenient(self.confidence)
    }
}

fn action_any_case<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Action, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Parse a CommandReply from raw command output.
///
/// Progress lines often carry their own JSON objects, so every candidate is
/// tried and the first one shaped like a reply wins.
pub fn parse_command_reply(raw: &str) -> Result<CommandReply, AgentError> {
    let mut last_error = None;
    for candidate in candidates(raw).into_iter().filter(|c| c.starts_with('{')) {
        match serde_json::from_str::<CommandReply>(candidate) {
            Ok(reply) => return Ok(reply),
            Err(e) => last_error = Some(e),
        }
    }
    Err(AgentError::Parse(match last_error {
        Some(e) => format!("command reply: {e}"),
        None => format!("no JSON object in output ({} bytes)", raw.len()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_json(text: &str) -> Option<serde_json::Value> {
        candidates(text)
            .into_iter()
            .filter(|c| c.starts_with('{'))
            .find_map(|c| serde_json::from_str(c).ok())
    }

    #[test]
    fn whole_output_is_json() {
        let value = extract_json(r#"  {"action": "buy", "confidence": 0.7}  "#).unwrap();
        assert_eq!(value["action"], "buy");
    }

    #[test]
    fn fenced_block_with_and_without_tag() {
        let tagged = "signal:\n```json\n{\"confidence\": 0.4}\n```\nbye";
        assert_eq!(extract_json(tagged).unwrap()["confidence"], 0.4);

        let bare = "```\n{\"confidence\": 12}\n```";
        assert_eq!(extract_json(bare).unwrap()["confidence"], 12);
    }

    #[test]
    fn braces_inside_strings_do_not_split_objects() {
        let input = r#"note {"rationale": "range {low} to {high}", "confidence": 0.5} end"#;
        let value = extract_json(input).unwrap();
        assert_eq!(value["rationale"], "range {low} to {high}");
    }

    #[test]
    fn escaped_quotes_stay_inside_strings() {
        let spans = object_spans(r#"x {"a": "say \"}\" ok"} y {"b": 1}"#);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1], r#"{"b": 1}"#);
    }

    #[test]
    fn plain_text_has_no_json() {
        assert!(extract_json("nothing structured here").is_none());
    }

    #[test]
    fn reply_after_progress_objects() {
        let input = r#"{"progress": 50}
{"progress": 100}
{"action": "buy", "confidence": 0.61, "rationale": "higher lows"}"#;
        let reply = parse_command_reply(input).unwrap();
        assert_eq!(reply.action, Action::Buy);
        assert_eq!(reply.score().value(), 61);
    }

    #[test]
    fn parse_fenced_command_reply() {
        let input = r#"Computed signal:
```json
{
    "action": "sell",
    "confidence": 0.82,
    "rationale": "momentum rolled over",
    "findings": {"rsi": 71.5}
}
```"#;

        let reply = parse_command_reply(input).unwrap();
        assert_eq!(reply.action, Action::Sell);
        assert_eq!(reply.score().value(), 82);
        assert_eq!(reply.rationale, "momentum rolled over");
        assert_eq!(reply.findings["rsi"], 71.5);
    }

    #[test]
    fn parse_reply_with_percent_confidence_and_defaults() {
        let reply = parse_command_reply(r#"{"action": "HOLD", "confidence": 64}"#).unwrap();
        assert_eq!(reply.action, Action::Hold);
        assert_eq!(reply.score().value(), 64);
        assert!(reply.findings.is_empty());
    }

    #[test]
    fn parse_reply_missing_action_fails() {
        let result = parse_command_reply(r#"{"confidence": 0.5}"#);
        assert!(matches!(result, Err(AgentError::Parse(_))));
    }
}
