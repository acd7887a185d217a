//! Pulls a structured result out of raw model text.
//!
//! Nothing here fails loudly: every path that cannot find structure returns
//! `None`, which the controller treats as malformed output for the attempt.

use serde_json::Value;

/// Array fields, in priority order, that may hold the per-item results.
const ITEM_ARRAY_KEYS: &[&str] = &["items", "lessons", "results", "data"];
/// Fields that may hold an item's identifier.
const ITEM_ID_KEYS: &[&str] = &["id", "lesson_id", "lessonId", "item_id", "itemId"];

/// How a requested item was paired with a returned sub-result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    /// Nth requested item taken from the Nth returned entry.
    Positional,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemMatch {
    pub requested_id: String,
    pub payload: Option<Value>,
    pub matched_by: MatchKind,
}

/// Interior of the first fenced code block, or the whole text.
pub fn strip_code_fence(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after_ticks = &raw[open + 3..];
    // Skip the info string ("json") up to the end of the line.
    let body = match after_ticks.find('\n') {
        Some(nl) => &after_ticks[nl + 1..],
        None => after_ticks,
    };
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// The JSON object candidate: first `{` to its balanced `}`, ignoring
/// braces inside string literals. Falls back to first `{` .. last `}`.
pub fn json_candidate(text: &str) -> Option<&str> {
    let start = text.find('{')?;
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
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parses the first JSON object found in `raw`.
pub fn parse_object(raw: &str) -> Option<Value> {
    let text = strip_code_fence(raw);
    let candidate = json_candidate(text).or_else(|| json_candidate(raw))?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "json candidate did not parse");
            None
        }
    }
}

/// Per-item entries of a parsed response.
fn entries(object: &Value) -> Vec<Value> {
    let Value::Object(map) = object else {
        return Vec::new();
    };
    for key in ITEM_ARRAY_KEYS {
        if let Some(Value::Array(arr)) = map.get(*key) {
            return arr.clone();
        }
    }
    // A bare object is the answer for a single item.
    vec![object.clone()]
}

fn entry_id(entry: &Value) -> Option<String> {
    ITEM_ID_KEYS.iter().find_map(|key| match entry.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Maps each requested identifier to its sub-result: exact id, then
/// case-insensitive id, then position. `None` means no structured result
/// for the whole batch.
pub fn extract_items(raw: &str, requested: &[&str]) -> Option<Vec<ItemMatch>> {
    let object = parse_object(raw)?;
    let entries = entries(&object);
    let ids: Vec<Option<String>> = entries.iter().map(entry_id).collect();

    let matches = requested
        .iter()
        .enumerate()
        .map(|(index, wanted)| {
            let exact = ids.iter().position(|id| id.as_deref() == Some(*wanted));
            let (found, kind) = match exact {
                Some(pos) => (Some(pos), MatchKind::Exact),
                None => match ids.iter().position(|id| {
                    id.as_deref()
                        .is_some_and(|id| id.eq_ignore_ascii_case(wanted))
                }) {
                    Some(pos) => (Some(pos), MatchKind::CaseInsensitive),
                    None if index < entries.len() => (Some(index), MatchKind::Positional),
                    None => (None, MatchKind::Missing),
                },
            };
            ItemMatch {
                requested_id: wanted.to_string(),
                payload: found.map(|pos| entries[pos].clone()),
                matched_by: kind,
            }
        })
        .collect();

    Some(matches)
}
