//! Result merge engine — idempotent reducer folding partial callback
//! payloads into a subtask's persisted result document.
//!
//! The engine performs no locking; callbacks for one subtask are serialized
//! by the protocol (one agent owns one subtask at a time). It never raises
//! on malformed input — unknown keys pass through, bad shapes are ignored
//! and prior values kept.

use serde_json::Value;

use crate::model::ResultDoc;

/// Fold an incoming partial result into the existing document.
///
/// - `codex_events` (a list) replaces the stored list — the executor sent a
///   full snapshot.
/// - `codex_event` (one event or a batch) appends to the stored list in
///   arrival order, never truncating prior entries.
/// - Scalar keys are last-write-wins; `shell_type` once set is sticky — a
///   later callback lacking it does not erase it.
pub fn merge_result(existing: &ResultDoc, incoming: &ResultDoc) -> ResultDoc {
    let mut merged = existing.clone();

    for (key, value) in &incoming.0 {
        match key.as_str() {
            // Full snapshot replaces; non-list shapes are ignored.
            "codex_events" => {
                if value.is_array() {
                    merged.set("codex_events", value.clone());
                }
            }
            // Incremental append — singular key never stored as-is.
            "codex_event" => {
                let mut events = merged
                    .0
                    .remove("codex_events")
                    .and_then(|v| match v {
                        Value::Array(items) => Some(items),
                        _ => None,
                    })
                    .unwrap_or_default();
                match value {
                    Value::Array(batch) => events.extend(batch.iter().cloned()),
                    Value::Null => {}
                    single => events.push(single.clone()),
                }
                merged.set("codex_events", Value::Array(events));
            }
            // Null never erases a prior value.
            _ if value.is_null() => {}
            _ => merged.set(key, value.clone()),
        }
    }

    merged
}
