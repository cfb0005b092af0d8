//! Narrow parsers over the opaque session payloads.
//!
//! The hub treats `metadata`, `agentState`, and message `content` as opaque
//! JSON. The few sub-fields it does understand — token usage, todo lists,
//! the metadata fields consulted during a session merge — are extracted by
//! the tolerant helpers in this module. A payload that does not match simply
//! yields `None`; it is never an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heartbeat timestamps further in the future than this are treated as
/// clock skew and clamped.
const MAX_FUTURE_SKEW_MS: i64 = 120_000;
/// Heartbeat timestamps older than this are stale enough to be meaningless.
const MAX_PAST_SKEW_MS: i64 = 600_000;

/// Clamp a client-reported event time into a plausible window around `now`.
pub fn clamp_event_time(reported: i64, now: i64) -> i64 {
    reported.clamp(now - MAX_PAST_SKEW_MS, now + MAX_FUTURE_SKEW_MS)
}

/// Parse a stored blob as a JSON object; anything else is `None`.
pub fn parse_object(raw: &str) -> Option<Value> {
    serde_json::from_str::<Value>(raw).ok().filter(Value::is_object)
}

/// Parse a stored blob as a JSON array; anything else is `None`.
pub fn parse_array(raw: &str) -> Option<Value> {
    serde_json::from_str::<Value>(raw).ok().filter(Value::is_array)
}

// ─── Usage extraction ─────────────────────────────────────────────────────────

/// Token accounting extracted from a message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, alias = "input_tokens")]
    pub input_tokens: i64,
    #[serde(default, alias = "output_tokens")]
    pub output_tokens: i64,
    #[serde(default, alias = "cache_creation_input_tokens")]
    pub cache_creation_input_tokens: i64,
    #[serde(default, alias = "cache_read_input_tokens")]
    pub cache_read_input_tokens: i64,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: i64,
}

/// Pull the usage sub-record out of a message payload.
///
/// Two encodings exist in the wild: a top-level `{"usage": {...}}` and the
/// nested `content.data.message.usage`. The outer one wins when both are
/// present. `totalTokens` is computed from the counters when absent.
pub fn extract_usage(content: &Value) -> Option<Usage> {
    let node = content.get("usage").or_else(|| {
        content
            .get("data")
            .and_then(|d| d.get("message"))
            .and_then(|m| m.get("usage"))
    })?;
    let mut usage: Usage = serde_json::from_value(node.clone()).ok()?;
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.input_tokens
            + usage.output_tokens
            + usage.cache_creation_input_tokens
            + usage.cache_read_input_tokens;
    }
    Some(usage)
}

// ─── Todo extraction ──────────────────────────────────────────────────────────

/// Pull a todo list out of a message payload, if it carries a todo write.
///
/// Recognized shapes: a top-level `{"todos": [...]}` and a todo-write tool
/// call inside `content.data.message.content[]` (the tool input's `todos`
/// array). The last matching entry in the content array wins.
pub fn extract_todos(content: &Value) -> Option<Value> {
    if let Some(todos) = content.get("todos").filter(|t| t.is_array()) {
        return Some(todos.clone());
    }
    let items = content
        .get("data")
        .and_then(|d| d.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)?;
    items
        .iter()
        .rev()
        .find_map(|item| item.get("input").and_then(|i| i.get("todos")))
        .filter(|t| t.is_array())
        .cloned()
}

// ─── Metadata merge ───────────────────────────────────────────────────────────

fn summary_updated_at(meta: &Value) -> Option<i64> {
    let summary = meta.get("summary")?;
    summary
        .get("updatedAt")
        .or_else(|| summary.get("updated_at"))
        .and_then(Value::as_i64)
}

/// Combine metadata when an old session is folded into its successor.
///
/// The successor's fields win, with three carve-outs:
/// - `name`, `worktree`, `path`, `host` fall back to the old session when
///   the successor lacks them;
/// - `summary` is taken from whichever side has the newer `updatedAt`.
pub fn merge_metadata(old: &Value, new: &Value) -> Value {
    let mut result = match new.as_object() {
        Some(map) => map.clone(),
        None => return old.clone(),
    };
    let old_map = match old.as_object() {
        Some(map) => map,
        None => return Value::Object(result),
    };

    for key in ["name", "worktree", "path", "host"] {
        if !result.contains_key(key) {
            if let Some(v) = old_map.get(key) {
                result.insert(key.to_string(), v.clone());
            }
        }
    }

    if let Some(old_ts) = summary_updated_at(old) {
        let new_ts = summary_updated_at(new).unwrap_or(i64::MIN);
        if old_ts > new_ts {
            if let Some(summary) = old_map.get("summary") {
                result.insert("summary".to_string(), summary.clone());
            }
        }
    }

    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamp_passes_plausible_times() {
        let now = 1_000_000_000;
        assert_eq!(clamp_event_time(now - 5_000, now), now - 5_000);
        assert_eq!(clamp_event_time(now, now), now);
    }

    #[test]
    fn clamp_rejects_skewed_clocks() {
        let now = 1_000_000_000;
        assert_eq!(clamp_event_time(now + 3_600_000, now), now + MAX_FUTURE_SKEW_MS);
        assert_eq!(clamp_event_time(0, now), now - MAX_PAST_SKEW_MS);
    }

    #[test]
    fn usage_outer_encoding_wins() {
        let content = json!({
            "usage": {"input_tokens": 10, "output_tokens": 5},
            "data": {"message": {"usage": {"input_tokens": 999}}}
        });
        let usage = extract_usage(&content).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn usage_nested_encoding_supported() {
        let content = json!({
            "data": {"message": {"usage": {
                "input_tokens": 7,
                "output_tokens": 3,
                "cache_read_input_tokens": 2
            }}}
        });
        let usage = extract_usage(&content).unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn usage_explicit_total_preserved() {
        let content = json!({"usage": {"input_tokens": 1, "total_tokens": 40}});
        assert_eq!(extract_usage(&content).unwrap().total_tokens, 40);
    }

    #[test]
    fn usage_absent_is_none() {
        assert!(extract_usage(&json!({"text": "hello"})).is_none());
        assert!(extract_usage(&json!({"usage": "oops"})).is_none());
    }

    #[test]
    fn todos_top_level() {
        let content = json!({"todos": [{"title": "a"}]});
        assert_eq!(extract_todos(&content).unwrap(), json!([{"title": "a"}]));
    }

    #[test]
    fn todos_from_tool_call_last_wins() {
        let content = json!({"data": {"message": {"content": [
            {"input": {"todos": [{"title": "first"}]}},
            {"text": "noise"},
            {"input": {"todos": [{"title": "second"}]}}
        ]}}});
        assert_eq!(extract_todos(&content).unwrap(), json!([{"title": "second"}]));
    }

    #[test]
    fn todos_absent_is_none() {
        assert!(extract_todos(&json!({"text": "x"})).is_none());
        assert!(extract_todos(&json!({"todos": "not-a-list"})).is_none());
    }

    #[test]
    fn merge_new_wins_by_default() {
        let old = json!({"name": "old", "custom": 1});
        let new = json!({"name": "new", "other": 2});
        let merged = merge_metadata(&old, &new);
        assert_eq!(merged["name"], "new");
        assert_eq!(merged["other"], 2);
        // Keys outside the carve-outs are not carried from the old side.
        assert!(merged.get("custom").is_none());
    }

    #[test]
    fn merge_falls_back_for_identity_fields() {
        let old = json!({"name": "old", "path": "/repo", "host": "box", "worktree": "wt"});
        let new = json!({"host": "newbox"});
        let merged = merge_metadata(&old, &new);
        assert_eq!(merged["name"], "old");
        assert_eq!(merged["path"], "/repo");
        assert_eq!(merged["worktree"], "wt");
        assert_eq!(merged["host"], "newbox");
    }

    #[test]
    fn merge_summary_newer_side_wins() {
        let old = json!({"summary": {"text": "old", "updatedAt": 200}});
        let new = json!({"summary": {"text": "new", "updatedAt": 100}});
        assert_eq!(merge_metadata(&old, &new)["summary"]["text"], "old");

        let newer = json!({"summary": {"text": "new", "updatedAt": 300}});
        assert_eq!(merge_metadata(&old, &newer)["summary"]["text"], "new");

        // Old summary also wins when the new side has none at all.
        let bare = json!({});
        assert_eq!(merge_metadata(&old, &bare)["summary"]["text"], "old");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn clamp_is_always_inside_window(reported in any::<i64>(), now in 0i64..4_000_000_000_000) {
                let clamped = clamp_event_time(reported, now);
                prop_assert!(clamped >= now - MAX_PAST_SKEW_MS);
                prop_assert!(clamped <= now + MAX_FUTURE_SKEW_MS);
            }

            #[test]
            fn usage_total_is_sum_when_unset(
                input in 0i64..1_000_000,
                output in 0i64..1_000_000,
                cache_create in 0i64..1_000_000,
                cache_read in 0i64..1_000_000,
            ) {
                let content = serde_json::json!({"usage": {
                    "input_tokens": input,
                    "output_tokens": output,
                    "cache_creation_input_tokens": cache_create,
                    "cache_read_input_tokens": cache_read,
                }});
                let usage = extract_usage(&content).unwrap();
                prop_assert_eq!(usage.total_tokens, input + output + cache_create + cache_read);
            }
        }
    }
}
