//! Agent CLI event protocol.
//!
//! The CLI emits newline-delimited JSON events. Three shapes carry
//! meaning here; everything else is passed through opaquely inside
//! `codex_events`:
//!
//! - `{"type": "thread.started", ...}` — carries the resumable thread id
//!   under `thread_id`, `threadId`, or nested inside `thread`.
//! - `{"type": "item.completed", "item": {"type": "agent_message", "text": ...}}`
//! - `{"type": "turn.failed", "error": {"message": ...}}`

use serde_json::Value;

/// Extract the resumable thread id from a `thread.started` event.
pub fn extract_thread_id(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("thread.started") {
        return None;
    }

    let mut candidates: Vec<&Value> = vec![];
    if let Some(v) = event.get("thread_id") {
        candidates.push(v);
    }
    if let Some(v) = event.get("threadId") {
        candidates.push(v);
    }
    if let Some(thread) = event.get("thread").filter(|t| t.is_object()) {
        for key in ["id", "thread_id", "threadId"] {
            if let Some(v) = thread.get(key) {
                candidates.push(v);
            }
        }
    }

    candidates
        .into_iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract the streamed assistant text from an `item.completed` event.
pub fn agent_message_text(event: &Value) -> Option<&str> {
    if event.get("type").and_then(Value::as_str) != Some("item.completed") {
        return None;
    }
    let item = event.get("item")?;
    if item.get("type").and_then(Value::as_str) != Some("agent_message") {
        return None;
    }
    item.get("text").and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Extract the failure message from a `turn.failed` event.
pub fn turn_failed_message(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("turn.failed") {
        return None;
    }
    Some(
        event
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("agent turn failed")
            .to_string(),
    )
}

/// Split streamed text into fixed-size chunks (char-boundary safe) so the
/// backend sees incremental value updates rather than one large write.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if text.is_empty() || chunk_size == 0 {
        return vec![];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_id_from_flat_keys() {
        assert_eq!(
            extract_thread_id(&json!({"type": "thread.started", "thread_id": "t1"})),
            Some("t1".into())
        );
        assert_eq!(
            extract_thread_id(&json!({"type": "thread.started", "threadId": " t2 "})),
            Some("t2".into())
        );
    }

    #[test]
    fn thread_id_from_nested_thread() {
        assert_eq!(
            extract_thread_id(&json!({"type": "thread.started", "thread": {"id": "t3"}})),
            Some("t3".into())
        );
    }

    #[test]
    fn thread_id_ignores_other_events_and_empty_values() {
        assert_eq!(extract_thread_id(&json!({"type": "item.completed"})), None);
        assert_eq!(
            extract_thread_id(&json!({"type": "thread.started", "thread_id": "  "})),
            None
        );
    }

    #[test]
    fn agent_message_requires_item_type() {
        let event = json!({
            "type": "item.completed",
            "item": {"type": "agent_message", "text": "hello"},
        });
        assert_eq!(agent_message_text(&event), Some("hello"));

        let other = json!({
            "type": "item.completed",
            "item": {"type": "tool_call", "text": "x"},
        });
        assert_eq!(agent_message_text(&other), None);
    }

    #[test]
    fn turn_failed_extracts_message() {
        let event = json!({"type": "turn.failed", "error": {"message": "rate limited"}});
        assert_eq!(turn_failed_message(&event), Some("rate limited".into()));

        let bare = json!({"type": "turn.failed"});
        assert_eq!(turn_failed_message(&bare), Some("agent turn failed".into()));
    }

    #[test]
    fn chunking_is_char_boundary_safe() {
        let chunks = chunk_text("héllo wörld", 4);
        assert_eq!(chunks.concat(), "héllo wörld");
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }

    #[test]
    fn chunking_empty_is_empty() {
        assert!(chunk_text("", 400).is_empty());
    }
}
