//! Recover a JSON object from free-form model text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```json\s*(.*?)\s*```").expect("json fence regex should compile")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("fenced ```json block is not valid JSON: {0}")]
    FencedBlockInvalid(String),
    #[error("fenced ```json block is not a JSON object")]
    NotAnObject,
    #[error("no JSON object found in model output")]
    NoJsonObject,
}

/// Extract the JSON object the model meant to return.
///
/// A ```json fence is authoritative: if present, its body must parse as an object
/// and no other part of the text is considered. Without a fence, every `{` is tried
/// as a candidate start in order and the first balanced span that parses as an
/// object wins.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, ExtractError> {
    if let Some(captures) = JSON_FENCE.captures(text)
        && let Some(body) = captures.get(1)
    {
        let value: Value = serde_json::from_str(body.as_str())
            .map_err(|err| ExtractError::FencedBlockInvalid(err.to_string()))?;
        return match value {
            Value::Object(map) => Ok(map),
            _ => Err(ExtractError::NotAnObject),
        };
    }

    for (start, ch) in text.char_indices() {
        if ch != '{' {
            continue;
        }
        let Some(span) = balanced_object_from(text, start) else {
            continue;
        };
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(span) {
            return Ok(map);
        }
    }
    Err(ExtractError::NoJsonObject)
}

/// Return the span from `start` (an opening brace) to its matching closing brace.
///
/// Braces inside string literals do not count; a backslash escapes the next
/// character while inside a string.
fn balanced_object_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
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
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}
