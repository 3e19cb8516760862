//! Tolerant JSON recovery for freeform model responses.
//!
//! Providers without structured output wrap JSON in prose or code fences, and
//! occasionally stop mid-object when they hit the token limit. [`parse_lenient`]
//! tries a strict parse first, then extracts the first balanced top-level
//! object, and finally closes whatever brackets a truncated response left open.

use serde_json::Value;

use crate::PayloadError;

/// Parses `text` as a JSON object, recovering from surrounding prose, code
/// fences and truncation.
pub fn parse_lenient(text: &str) -> Result<Value, PayloadError> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let candidate = extract_object(trimmed).ok_or(PayloadError::NoJson)?;
    match serde_json::from_str::<Value>(&candidate) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(PayloadError::NoJson),
        Err(e) => Err(PayloadError::Shape(e.to_string())),
    }
}

/// Returns the first top-level JSON object in `text`, balancing brackets.
///
/// If the text ends inside the object, the open string (if any) and every open
/// bracket are closed in order. A trailing comma left by truncation is dropped.
pub fn extract_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let body = &text[start..];

    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in body.char_indices() {
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
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(c) {
                    return None;
                }
                if closers.is_empty() {
                    return Some(body[..offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    // Truncated: repair by closing everything still open.
    let mut repaired = body.to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    }
    let kept = repaired.trim_end().trim_end_matches(',').len();
    repaired.truncate(kept);
    while let Some(closer) = closers.pop() {
        repaired.push(closer);
    }
    Some(repaired)
}
