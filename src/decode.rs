//! Resilient decode boundary for generation output.
//!
//! Generation collaborators return free text that usually contains JSON but
//! may wrap it in markdown fences or conversational filler. Decoding runs in
//! three steps: strict parse, fence-stripped parse, then a scan for the
//! first balanced JSON object. Exhausting all three yields a typed error —
//! never an absent value the caller might forget to check.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no JSON found in response ({preview})")]
    NoJson { preview: String },

    #[error("JSON did not match the expected shape for {what}: {source}")]
    Shape {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*\n([\s\S]*?)\n\s*```").expect("static regex"))
}

/// Extract and deserialize a JSON value of type `T` from raw generation
/// output.
pub fn extract<T: DeserializeOwned>(response: &str, what: &'static str) -> Result<T, DecodeError> {
    let text = extract_json_text(response)?;
    serde_json::from_str(&text).map_err(|source| DecodeError::Shape { what, source })
}

/// Locate the JSON payload inside a response, without deserializing.
fn extract_json_text(response: &str) -> Result<String, DecodeError> {
    let trimmed = response.trim();

    // 1. The whole response is already valid JSON.
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Ok(trimmed.to_string());
    }

    // 2. A fenced code block containing valid JSON.
    if let Some(caps) = fence_re().captures(trimmed) {
        let inner = caps[1].trim();
        if serde_json::from_str::<serde_json::Value>(inner).is_ok() {
            return Ok(inner.to_string());
        }
    }

    // 3. First balanced top-level object anywhere in the text.
    if let Some(candidate) = first_balanced_object(trimmed)
        && serde_json::from_str::<serde_json::Value>(&candidate).is_ok()
    {
        return Ok(candidate);
    }

    Err(DecodeError::NoJson {
        preview: preview(trimmed),
    })
}

/// Scan for the first `{ ... }` span with balanced braces, ignoring braces
/// inside string literals.
fn first_balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    if text.len() <= LIMIT {
        text.to_string()
    } else {
        let mut end = LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}
