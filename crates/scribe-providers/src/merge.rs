//! Structural merge of streamed deltas into a running response.

use scribe_types::ToolCall;
use serde_json::{json, Value};

use crate::stream::Delta;

/// Appended to a response cut short by cancellation.
pub const ABORTED_MARKER: &str = "\n\n[Aborted]";

/// Folds `fragment` into `target`, ignoring nulls in the fragment.
///
/// Integers add, strings concatenate, objects merge key by key and list items
/// are matched to accumulated items by their `index` value (appended when
/// unmatched). Anything else replaces the accumulated value. The `index` key
/// itself is never summed since it identifies an item rather than measuring it.
pub fn append_non_null(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Number(acc), Value::Number(add)) if is_integer(acc) && is_integer(add) => {
            if let Some(sum) = sum_integers(acc, add) {
                *acc = sum;
            }
        }
        (Value::String(acc), Value::String(add)) => acc.push_str(add),
        (Value::Object(acc), Value::Object(add)) => {
            for (key, value) in add {
                if value.is_null() {
                    continue;
                }
                match acc.get_mut(key) {
                    Some(existing) => append_non_null(existing, value),
                    None => {
                        acc.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(acc), Value::Array(add)) => {
            for item in add {
                let slot = item
                    .get("index")
                    .filter(|_| item.is_object())
                    .and_then(|index| {
                        acc.iter_mut().find(|existing| {
                            existing.is_object() && existing.get("index") == Some(index)
                        })
                    });
                match slot {
                    Some(Value::Object(existing)) => {
                        if let Value::Object(incoming) = item {
                            for (key, value) in incoming {
                                if key == "index" || value.is_null() {
                                    continue;
                                }
                                match existing.get_mut(key) {
                                    Some(current) => append_non_null(current, value),
                                    None => {
                                        existing.insert(key.clone(), value.clone());
                                    }
                                }
                            }
                        }
                    }
                    _ => acc.push(item.clone()),
                }
            }
        }
        (target, fragment) => {
            if !fragment.is_null() {
                *target = fragment.clone();
            }
        }
    }
}

fn is_integer(number: &serde_json::Number) -> bool {
    number.is_i64() || number.is_u64()
}

fn sum_integers(a: &serde_json::Number, b: &serde_json::Number) -> Option<serde_json::Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.checked_add(y).map(Into::into);
    }
    match (a.as_u64(), b.as_u64()) {
        (Some(x), Some(y)) => x.checked_add(y).map(Into::into),
        _ => None,
    }
}

/// Running `{role, content}` text plus index-keyed tool-call fragments for one
/// response.
#[derive(Debug, Clone)]
pub struct ResponseAccumulator {
    role: String,
    content: String,
    tool_calls: Value,
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self {
            role: String::new(),
            content: String::new(),
            tool_calls: json!([]),
        }
    }
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text that should reach the output sink, if any.
    pub fn apply(&mut self, delta: &Delta) -> Option<String> {
        match delta {
            Delta::Text { role, content } => {
                if let Some(role) = role.as_deref().filter(|r| !r.is_empty()) {
                    self.role = role.to_string();
                }
                let text = content.as_deref().filter(|c| !c.is_empty())?;
                self.content.push_str(text);
                Some(text.to_string())
            }
            Delta::ToolCalls(fragment) => {
                append_non_null(&mut self.tool_calls, fragment);
                None
            }
        }
    }

    /// Applies the synthetic role and marker deltas of a cancelled stream and
    /// returns the marker for the sink.
    pub fn abort(&mut self) -> String {
        self.apply(&Delta::Text {
            role: Some("assistant".to_string()),
            content: None,
        });
        self.apply(&Delta::Text {
            role: None,
            content: Some(ABORTED_MARKER.to_string()),
        })
        .unwrap_or_default()
    }

    /// Role as sent by the provider; some providers never send one.
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_array()
            .is_some_and(|calls| !calls.is_empty())
    }

    pub fn tool_calls(&self) -> Result<Vec<ToolCall>, serde_json::Error> {
        serde_json::from_value(self.tool_calls.clone())
    }
}
