//! Best-effort reconstruction of tool-call arguments from partial JSON
//! fragments.
//!
//! Engines stream tool arguments as raw text chunks that are rarely valid
//! JSON on their own. Each call index owns a [`FragmentBuffer`] that
//! accumulates the raw text and, after every chunk, tries a strict parse
//! followed by two repair strategies. Accepted candidates are gated so a
//! repaired object never visibly shrinks between publishes.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Accumulator for one tool call's streamed argument text.
#[derive(Debug, Default, Clone)]
pub struct FragmentBuffer {
    pub name: Option<String>,
    raw: String,
    best: Option<Value>,
}

impl FragmentBuffer {
    /// Feeds one argument fragment and returns the new best candidate, if
    /// the fragment produced one that passes the monotonic gate.
    ///
    /// A non-string fragment is a complete value delivered by the engine and
    /// replaces the candidate outright.
    pub fn push(&mut self, fragment: &Value) -> Option<Value> {
        if !fragment.is_string() && !fragment.is_null() {
            self.best = Some(fragment.clone());
            return Some(fragment.clone());
        }
        if let Some(text) = fragment.as_str() {
            self.raw.push_str(text);
        }

        let candidate = parse_or_recover(&self.raw)?;
        if self.accepts(&candidate) {
            self.best = Some(candidate.clone());
            return Some(candidate);
        }
        None
    }

    /// Latest accepted candidate.
    pub fn best(&self) -> Option<&Value> {
        self.best.as_ref()
    }

    /// Raw text accumulated so far.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn accepts(&self, candidate: &Value) -> bool {
        let Some(previous) = &self.best else {
            return true;
        };
        top_level_key_count(candidate) >= top_level_key_count(previous)
            && string_payload_len(candidate) >= string_payload_len(previous)
    }
}

/// Parses accumulated argument text, applying repair strategies in priority
/// order when the strict parse fails.
fn parse_or_recover(raw: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    if let Ok(value) = serde_json::from_str::<Value>(&close_open(raw)) {
        return Some(value);
    }
    serde_json::from_str::<Value>(&close_open(&strip_trailing_fragment(raw))).ok()
}

/// Close-open repair: terminate an unterminated string, then close every
/// still-open array and object innermost-first. Keeps a trailing incomplete
/// key/value pair so in-progress string fields stay visible.
fn close_open(raw: &str) -> String {
    let mut in_string = false;
    let mut escaped = false;
    let mut open_stack: Vec<char> = Vec::new();

    for ch in raw.chars() {
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
            '{' | '[' => open_stack.push(ch),
            '}' | ']' => {
                open_stack.pop();
            }
            _ => {}
        }
    }

    let mut repaired = raw.to_string();
    if escaped {
        // A lone trailing backslash would swallow the closing quote.
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    while let Some(open) = open_stack.pop() {
        repaired.push(if open == '{' { '}' } else { ']' });
    }
    repaired
}

/// Strip-and-close repair: drop the trailing incomplete `"key": value` or
/// `"key` fragment before re-balancing.
fn strip_trailing_fragment(raw: &str) -> String {
    static TRAILING_FRAGMENT: OnceLock<Regex> = OnceLock::new();
    let pattern = TRAILING_FRAGMENT.get_or_init(|| {
        Regex::new(
            r#",?\s*"(?:[^"\\]|\\.)*"?\s*(?::\s*(?:"(?:[^"\\]|\\.)*"?|[^,{}\[\]"]*))?\s*$"#,
        )
        .unwrap_or_else(|error| panic!("trailing fragment pattern failed to compile: {error}"))
    });

    let mut stripped = pattern.replace(raw, "").into_owned();
    while stripped.ends_with(',') || stripped.ends_with(':') || stripped.ends_with(' ') {
        stripped.pop();
    }
    stripped
}

fn top_level_key_count(value: &Value) -> usize {
    value.as_object().map(|map| map.len()).unwrap_or(0)
}

/// Total length of every string value reachable in the document.
fn string_payload_len(value: &Value) -> usize {
    match value {
        Value::String(text) => text.len(),
        Value::Array(items) => items.iter().map(string_payload_len).sum(),
        Value::Object(map) => map.values().map(string_payload_len).sum(),
        _ => 0,
    }
}
