//! Best-effort recovery of JSON from text-generation output

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

static FENCE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*(.*?)\s*```\s*$").unwrap());

static FENCE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```[A-Za-z0-9_-]*\s*").unwrap());

/// Which fallback produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeTier {
    /// The whole output (fences stripped) was a JSON object or array.
    Clean,
    /// A bracketed JSON fragment was found inside surrounding prose.
    Extracted,
    /// Nothing parsed; the text was wrapped into an empty summary.
    Wrapped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub value: Value,
    pub tier: SanitizeTier,
}

/// Always yields a JSON object or array, whatever the model returned.
pub fn sanitize_model_output(raw: &str) -> Sanitized {
    let text = strip_code_fences(raw.trim());

    if let Some(value) = parse_structured(text) {
        return Sanitized {
            value,
            tier: SanitizeTier::Clean,
        };
    }

    if let Some(value) = extract_first_structured(text) {
        return Sanitized {
            value,
            tier: SanitizeTier::Extracted,
        };
    }

    Sanitized {
        value: wrap_raw_text(text),
        tier: SanitizeTier::Wrapped,
    }
}

/// The structured shape summaries are asked to follow.
///
/// Nothing enforces it on model output; it is used to build the wrap tier
/// and to read summaries leniently (every field defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryPayload {
    pub persona_signals: Vec<Value>,
    pub facts: Vec<Value>,
    pub goals: Vec<Value>,
    pub issues: Vec<Value>,
    pub commitments: Vec<Value>,
    pub emotions_trend: String,
    pub todo_us: Vec<Value>,
    pub todo_user: Vec<Value>,
    pub time_span: PayloadSpan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadSpan {
    pub from: i64,
    pub to: i64,
}

/// An empty summary carrying unparseable text in `raw_text`.
pub fn wrap_raw_text(text: &str) -> Value {
    let payload = SummaryPayload {
        raw_text: Some(text.to_string()),
        ..SummaryPayload::default()
    };
    serde_json::to_value(payload).unwrap_or_else(|_| json!({ "raw_text": text }))
}

/// Remove a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_fences(text: &str) -> &str {
    if !text.starts_with("```") {
        return text;
    }
    if let Some(caps) = FENCE_BLOCK.captures(text) {
        if let Some(inner) = caps.get(1) {
            return inner.as_str().trim();
        }
    }
    // opening fence without a closing one
    match FENCE_OPEN.find(text) {
        Some(m) => text[m.end()..].trim(),
        None => text,
    }
}

fn parse_structured(text: &str) -> Option<Value> {
    if !(text.starts_with('{') || text.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// First balanced `{...}` or `[...]` span that parses, scanning left to right.
fn extract_first_structured(text: &str) -> Option<Value> {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .find_map(|(start, _)| {
            let end = balanced_end(&text[start..])?;
            parse_structured(&text[start..start + end])
        })
}

/// Byte length of the bracketed span opening at the start of `text`.
/// String literals are skipped so brackets inside them do not count.
fn balanced_end(text: &str) -> Option<usize> {
    let mut expected: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => expected.push('}'),
            '[' => expected.push(']'),
            '}' | ']' => {
                if expected.pop() != Some(c) {
                    return None;
                }
                if expected.is_empty() {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Millisecond `time_span.from`/`time_span.to` of a summary, when positive.
pub fn time_span_of(value: &Value) -> (Option<i64>, Option<i64>) {
    let span = value.get("time_span");
    let field = |name: &str| {
        span.and_then(|s| s.get(name))
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .filter(|v| *v > 0)
    };
    (field("from"), field("to"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_object() {
        let out = sanitize_model_output(r#"  {"facts": ["a"]}  "#);
        assert_eq!(out.tier, SanitizeTier::Clean);
        assert_eq!(out.value["facts"][0], "a");
    }

    #[test]
    fn test_fenced_output() {
        let out = sanitize_model_output("```json\n[{\"facts\": []}, {\"goals\": []}]\n```");
        assert_eq!(out.tier, SanitizeTier::Clean);
        assert_eq!(out.value.as_array().map(|a| a.len()), Some(2));

        let out = sanitize_model_output("```\n{\"facts\": [1]}");
        assert_eq!(out.tier, SanitizeTier::Clean);
    }

    #[test]
    fn test_extracts_embedded_json() {
        let out = sanitize_model_output(
            "Here is the summary you asked for: {\"facts\": [\"likes {braces}\"]} Hope it helps!",
        );
        assert_eq!(out.tier, SanitizeTier::Extracted);
        assert_eq!(out.value["facts"][0], "likes {braces}");
    }

    #[test]
    fn test_skips_unparseable_fragment() {
        let out = sanitize_model_output("note [see below] then {\"goals\": [\"ship\"]}");
        assert_eq!(out.tier, SanitizeTier::Extracted);
        assert_eq!(out.value["goals"][0], "ship");
    }

    #[test]
    fn test_prose_is_wrapped() {
        let out = sanitize_model_output("The user wants a refund for order 1234.");
        assert_eq!(out.tier, SanitizeTier::Wrapped);
        assert_eq!(out.value["raw_text"], "The user wants a refund for order 1234.");
        assert_eq!(out.value["time_span"]["from"], 0);
        assert_eq!(out.value["emotions_trend"], "");
        assert!(out.value["todo_user"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_bare_scalar_is_not_a_summary() {
        let out = sanitize_model_output("42");
        assert_eq!(out.tier, SanitizeTier::Wrapped);
        assert_eq!(out.value["raw_text"], "42");
    }

    #[test]
    fn test_payload_reads_leniently() {
        let payload: SummaryPayload =
            serde_json::from_value(json!({"facts": ["a"], "extra": 1})).unwrap();
        assert_eq!(payload.facts.len(), 1);
        assert_eq!(payload.time_span, PayloadSpan::default());

        let wrapped: SummaryPayload = serde_json::from_value(wrap_raw_text("x")).unwrap();
        assert!(wrapped.facts.is_empty());
        assert_eq!(wrapped.raw_text.as_deref(), Some("x"));
        assert!(serde_json::from_value::<SummaryPayload>(json!({"facts": "not a list"})).is_err());
    }

    #[test]
    fn test_time_span_of() {
        let value = json!({"time_span": {"from": 1_700_000_000_000i64, "to": 0}});
        assert_eq!(time_span_of(&value), (Some(1_700_000_000_000), None));
        assert_eq!(time_span_of(&json!({"facts": []})), (None, None));
    }
}
