//! Message normalization for providers that reject back-to-back user turns.

use serde_json::{json, Value};

const MERGE_SEPARATOR: &str = "\n\n";

fn is_user(message: &Value) -> bool {
    message.get("role").and_then(Value::as_str) == Some("user")
}

/// Content as a list of parts. Plain text becomes a single text part;
/// anything that is neither text nor a part list cannot be merged.
fn as_parts(content: &Value) -> Option<Vec<Value>> {
    match content {
        Value::String(text) => Some(vec![json!({"type": "text", "text": text})]),
        Value::Array(parts) => Some(parts.clone()),
        _ => None,
    }
}

/// Merged content of two user turns, or `None` when they cannot be merged.
fn merge_content(first: &Value, second: &Value) -> Option<Value> {
    if let (Value::String(a), Value::String(b)) = (first, second) {
        return Some(Value::String(format!("{a}{MERGE_SEPARATOR}{b}")));
    }
    let mut parts = as_parts(first)?;
    parts.extend(as_parts(second)?);
    Some(Value::Array(parts))
}

/// Merge consecutive `user` turns when the provider requires alternation.
///
/// The earlier turn keeps its position and absorbs the later content: text
/// after a blank line, content parts appended in order. Turns whose content
/// is missing or not text/parts are left unmerged, as is any other adjacency
/// (assistant/assistant, system/user, ...). Without the requirement the
/// conversation is returned as is.
pub fn normalize(messages: &[Value], requires_alternation: bool) -> Vec<Value> {
    if !requires_alternation {
        return messages.to_vec();
    }

    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for message in messages {
        if is_user(message) {
            if let Some(last) = out.last_mut().filter(|m| is_user(m)) {
                let merged = match (last.get("content"), message.get("content")) {
                    (Some(a), Some(b)) => merge_content(a, b),
                    _ => None,
                };
                if let Some(content) = merged {
                    last["content"] = content;
                    continue;
                }
            }
        }
        out.push(message.clone());
    }
    out
}
