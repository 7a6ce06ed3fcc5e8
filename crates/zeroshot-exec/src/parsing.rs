//! Pure helpers over task-runner output: NDJSON log lines, status text,
//! and the final structured result. No I/O — easy to exhaustively test.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use zeroshot_types::{ModelUsageEntry, TokenUsage};

fn status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Status:\s+(completed|failed|running|pending)").unwrap())
}

fn status_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Error:\s*(.+)").unwrap())
}

fn tail_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(Error:|error:|failed:|Exception:|panic:)").unwrap())
}

fn fenced_json_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap())
}

fn corrupted_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^"?[A-Za-z0-9_]+(\s*\|\s*[A-Za-z0-9_]+)+"?$"#).unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Completed,
    Failed,
    Running,
    Pending,
    Unknown,
}

pub fn parse_status(status_text: &str) -> StatusOutcome {
    match status_regex()
        .captures(status_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .as_deref()
    {
        Some("completed") => StatusOutcome::Completed,
        Some("failed") => StatusOutcome::Failed,
        Some("running") => StatusOutcome::Running,
        Some("pending") => StatusOutcome::Pending,
        _ => StatusOutcome::Unknown,
    }
}

/// Strips an optional `[<13-digit-epoch-ms>]` prefix, returning the
/// parsed timestamp (if present) and the remaining text.
pub fn strip_timestamp_prefix(line: &str) -> (Option<i64>, &str) {
    if let Some(rest) = line.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let candidate = &rest[..close];
            if candidate.len() == 13 && candidate.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(ts) = candidate.parse::<i64>() {
                    return (Some(ts), &rest[close + 1..]);
                }
            }
        }
    }
    (None, line)
}

fn is_decorative_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    if trimmed
        .chars()
        .all(|c| c == '-' || c == '=' || c == '*' || c == '_')
    {
        return true;
    }
    trimmed.starts_with("Finished:") || trimmed.starts_with("Exit code:")
}

fn is_init_event(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("system")
        && value.get("subtype").and_then(Value::as_str) == Some("init")
}

/// One accepted NDJSON task-log line: its (optional) embedded timestamp
/// and the parsed JSON event. Decorative lines, the init event, and
/// anything that isn't a `{...}` object are dropped silently.
pub fn parse_log_line(raw: &str) -> Option<(Option<i64>, Value)> {
    let (timestamp, residue) = strip_timestamp_prefix(raw);
    let residue = residue.trim();
    if is_decorative_line(residue) || !residue.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(residue).ok()?;
    if is_init_event(&value) {
        return None;
    }
    Some((timestamp, value))
}

pub fn is_result_event(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("result")
}

pub fn extract_token_usage(result_event: &Value) -> Option<TokenUsage> {
    let usage = result_event.get("usage")?;
    Some(TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_read_input_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_creation_input_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        total_cost_usd: result_event.get("total_cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
        duration_ms: result_event.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        model_usage: result_event
            .get("modelUsage")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value::<ModelUsageEntry>(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn extract_fenced_json(text: &str) -> Option<Value> {
    let captures = fenced_json_regex().captures(text)?;
    serde_json::from_str(&captures[1]).ok()
}

const RESULT_EVENT_META_KEYS: &[&str] = &[
    "type",
    "subtype",
    "usage",
    "total_cost_usd",
    "duration_ms",
    "modelUsage",
    "structured_output",
    "result",
];

/// `parseResultOutput`: given the last `type:"result"` event (if the
/// stream contained one) and the raw last non-empty line as fallback,
/// resolves the final structured output.
pub fn parse_result_output(
    result_event: Option<&Value>,
    last_raw_line: &str,
    json_schema: Option<&Value>,
) -> Result<Value, String> {
    if json_schema.is_some() {
        if let Some(event) = result_event {
            if let Some(structured) = event.get("structured_output") {
                return Ok(structured.clone());
            }
            if let Some(result) = event.get("result") {
                match result {
                    Value::Object(_) => return Ok(result.clone()),
                    Value::String(text) => {
                        if let Some(value) = extract_fenced_json(text) {
                            return Ok(value);
                        }
                        if let Ok(value) = serde_json::from_str::<Value>(text) {
                            return Ok(value);
                        }
                    }
                    _ => {}
                }
            }
            if let Value::Object(map) = event {
                if map.keys().any(|key| !RESULT_EVENT_META_KEYS.contains(&key.as_str())) {
                    return Ok(event.clone());
                }
            }
        }
    }

    if let Some(value) = extract_fenced_json(last_raw_line) {
        return Ok(value);
    }
    if let Ok(value) = serde_json::from_str::<Value>(last_raw_line) {
        return Ok(value);
    }
    Err("output missing required JSON block".to_string())
}

/// Lightweight structural check: every name in `schema.required` must be
/// present at the top level of `value`. Not a full JSON Schema validator,
/// just enough to gate on required-field presence.
pub fn validate_against_schema(value: &Value, schema: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for name in required {
        let Some(name) = name.as_str() else { continue };
        if value.get(name).is_none() {
            return Err(format!("missing required field `{name}`"));
        }
    }
    Ok(())
}

fn is_corrupted_message(message: &str) -> bool {
    corrupted_type_regex().is_match(message.trim())
}

fn tail_preview(text: &str) -> String {
    let start = text.len().saturating_sub(200);
    let preview = text[start..].trim();
    if preview.is_empty() {
        "(no output captured)".to_string()
    } else {
        preview.to_string()
    }
}

/// Resolves the error message for a failed task: prefer `Error:` from
/// the status text, then scan the last 500 output chars, then a generic
/// fallback. Corrupted pseudo-type strings (e.g. `"string | null"`) are
/// rejected at each stage rather than surfaced to the operator.
pub fn resolve_error_message(status_text: &str, output_tail: &str) -> String {
    if let Some(captures) = status_error_regex().captures(status_text) {
        let message = captures[1].trim().to_string();
        if !message.is_empty() && !is_corrupted_message(&message) {
            return message;
        }
    }

    let window_start = output_tail.len().saturating_sub(500);
    let window = &output_tail[window_start..];
    if tail_error_regex().is_match(window) {
        let message = window.trim().to_string();
        if !is_corrupted_message(&message) {
            return message;
        }
    }

    format!("Task failed. Last output: {}", tail_preview(output_tail))
}
