//! Selector detection: field paths for leaf sitemaps and CSS selectors for
//! rendered pages.
//!
//! Both detectors go through the same [`AskAsync`] seam and the same JSON
//! recovery: the model's reply is free text that hopefully contains one JSON
//! object.

pub mod css;
pub mod gateway;
pub mod nav;

use crate::api::AskAsync;
use crate::utils::{looks_truncated, truncate_for_log};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

pub use css::CssDetector;
pub use gateway::SelectorGateway;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)```(?:json)?\s*([\s\S]*?)```").expect("static regex"));

/// First JSON value found in a model reply.
///
/// Tries the whole reply, then a fenced code block, then the first balanced
/// `{...}` block that parses.
pub fn extract_json(text: &str) -> Option<Value> {
    let s = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(s) {
        return Some(v);
    }
    if let Some(inner) = FENCE_RE.captures(s).and_then(|c| c.get(1)) {
        if let Ok(v) = serde_json::from_str::<Value>(inner.as_str().trim()) {
            return Some(v);
        }
    }
    s.match_indices('{')
        .filter_map(|(start, _)| balanced_end(s, start).map(|end| &s[start..end]))
        .find_map(|block| serde_json::from_str::<Value>(block).ok())
}

/// Byte offset just past the `}` closing the `{` at `start`. Braces inside
/// JSON strings do not count.
fn balanced_end(s: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
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
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Whether a reply looks like JSON cut off mid-object.
fn reply_truncated(text: &str) -> bool {
    let s = text.trim();
    let Some(lb) = s.find('{') else {
        return false;
    };
    match serde_json::from_str::<Value>(&s[lb..]) {
        Err(e) => looks_truncated(&e),
        Ok(_) => false,
    }
}

/// Ask the detector and pull a JSON object out of the reply. A reply that
/// looks truncated is re-asked once.
pub async fn ask_json<L>(detector: &L, prompt: &str) -> Result<Value, String>
where
    L: AskAsync<Response = String>,
{
    let mut reply = detector.ask(prompt).await.map_err(|e| e.to_string())?;
    if let Some(v) = extract_json(&reply) {
        return Ok(v);
    }
    if reply_truncated(&reply) {
        warn!(len = reply.len(), "Detector reply looks truncated; asking again");
        reply = detector.ask(prompt).await.map_err(|e| e.to_string())?;
        if let Some(v) = extract_json(&reply) {
            return Ok(v);
        }
    }
    debug!(reply = %truncate_for_log(&reply, 300), "No JSON in detector reply");
    Err("no JSON object in detector reply".to_string())
}

/// Normalise a model-reported confidence into `[0, 1]`.
///
/// Numbers above 1 are read as percentages; strings may be numeric, carry a
/// `%` sign, or be one of the labels `very high`, `high`, `medium`, `low`.
pub fn parse_confidence(v: Option<&Value>) -> f64 {
    let raw = match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let t = s.trim().to_lowercase();
            match t.as_str() {
                "very high" => Some(0.98),
                "high" => Some(0.9),
                "medium" => Some(0.6),
                "low" => Some(0.3),
                _ => t.trim_end_matches('%').trim().parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    match raw {
        Some(x) if x.is_finite() => {
            let x = if x > 1.0 { x / 100.0 } else { x };
            x.clamp(0.0, 1.0)
        }
        _ => crate::models::default_confidence(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedAsk;
    use serde_json::json;

    #[test]
    fn json_recovery_order() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a":1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nthanks"),
            Some(json!({"a":2}))
        );
        assert_eq!(extract_json("prefix {\"a\": 3} suffix"), Some(json!({"a":3})));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn first_balanced_object_wins() {
        assert_eq!(
            extract_json(r#"Here: {"a":1} and also {"b":2}"#),
            Some(json!({"a":1}))
        );
        assert_eq!(
            extract_json(r#"{"fields": {"url": "loc"}} (use {braces} sparingly)"#),
            Some(json!({"fields": {"url": "loc"}}))
        );
        assert_eq!(
            extract_json(r#"note: {"sel": "a[href*='}']", "q": "say \"{\""} done"#),
            Some(json!({"sel": "a[href*='}']", "q": "say \"{\""}))
        );
        // an unparsable first block falls through to the next one
        assert_eq!(extract_json(r#"{not json} {"c": 3}"#), Some(json!({"c": 3})));
    }

    #[test]
    fn confidence_normalisation() {
        assert_eq!(parse_confidence(Some(&json!(0.8))), 0.8);
        assert_eq!(parse_confidence(Some(&json!(85))), 0.85);
        assert_eq!(parse_confidence(Some(&json!("85%"))), 0.85);
        assert_eq!(parse_confidence(Some(&json!("Very High"))), 0.98);
        assert_eq!(parse_confidence(Some(&json!("medium"))), 0.6);
        assert_eq!(parse_confidence(Some(&json!(-2))), 0.0);
        assert_eq!(parse_confidence(Some(&json!(500))), 1.0);
        assert_eq!(parse_confidence(Some(&json!("sure"))), 0.7);
        assert_eq!(parse_confidence(None), 0.7);
    }

    #[tokio::test]
    async fn truncated_reply_is_asked_again() {
        let det = ScriptedAsk::new().reply(r#"{"fields": {"url": "lo"#).reply(r#"{"ok": true}"#);
        assert_eq!(ask_json(&det, "p").await.unwrap(), json!({"ok": true}));
        assert_eq!(det.call_count(), 2);
    }

    #[tokio::test]
    async fn prose_reply_is_not_retried() {
        let det = ScriptedAsk::new().reply("I cannot help with that").reply("{}");
        assert!(ask_json(&det, "p").await.is_err());
        assert_eq!(det.call_count(), 1);
    }
}
