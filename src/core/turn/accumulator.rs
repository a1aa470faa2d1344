//! Reassembles streamed tool-call fragments into complete calls.

use crate::core::message::ToolCallRequest;
use crate::utils::ids::new_tool_call_id;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// A finished call. `parse_error` is set when the arguments were not valid
/// JSON; the raw text is then kept as a JSON string.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedCall {
    pub request: ToolCallRequest,
    pub parse_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn push(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: Option<String>,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            call.id = Some(id);
        }
        if let Some(name) = name {
            call.name.push_str(&name);
        }
        if let Some(fragment) = arguments_fragment {
            call.arguments.push_str(&fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls in index order. Ids are made unique: a missing id or
    /// one already present in `taken` (or earlier in this batch) is
    /// replaced by a fresh one.
    pub fn finish(self, taken: &HashSet<&str>) -> Vec<AccumulatedCall> {
        let mut seen: HashSet<String> = HashSet::new();
        self.calls
            .into_values()
            .map(|call| {
                let id = match call.id {
                    Some(id) if !taken.contains(id.as_str()) && !seen.contains(&id) => id,
                    _ => fresh_id(taken, &seen),
                };
                seen.insert(id.clone());

                let raw = call.arguments.trim();
                let (arguments, parse_error) = if raw.is_empty() {
                    (Value::Object(Default::default()), None)
                } else {
                    match serde_json::from_str::<Value>(raw) {
                        Ok(value) => (value, None),
                        Err(err) => (Value::String(raw.to_string()), Some(err.to_string())),
                    }
                };

                AccumulatedCall {
                    request: ToolCallRequest {
                        id,
                        name: call.name.trim().to_string(),
                        arguments,
                    },
                    parse_error,
                }
            })
            .collect()
    }
}

fn fresh_id(taken: &HashSet<&str>, seen: &HashSet<String>) -> String {
    loop {
        let id = new_tool_call_id();
        if !taken.contains(id.as_str()) && !seen.contains(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragments_are_joined_per_index() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(1, Some("b".into()), Some("files.write".into()), Some("{\"pa".into()));
        acc.push(0, Some("a".into()), Some("files.read".into()), None);
        acc.push(1, None, None, Some("th\":\"x\"}".into()));
        acc.push(0, None, None, Some("{}".into()));

        let calls = acc.finish(&HashSet::new());
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].request.id, "a");
        assert_eq!(calls[0].request.name, "files.read");
        assert_eq!(calls[0].request.arguments, json!({}));
        assert_eq!(calls[1].request.id, "b");
        assert_eq!(calls[1].request.arguments, json!({"path": "x"}));
        assert!(calls.iter().all(|call| call.parse_error.is_none()));
    }

    #[test]
    fn missing_and_duplicate_ids_are_replaced() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, None, Some("a.one".into()), None);
        acc.push(1, Some("dup".into()), Some("a.two".into()), None);
        acc.push(2, Some("dup".into()), Some("a.three".into()), None);
        acc.push(3, Some("old".into()), Some("a.four".into()), None);

        let taken = HashSet::from(["old"]);
        let calls = acc.finish(&taken);
        let ids: Vec<&str> = calls.iter().map(|call| call.request.id.as_str()).collect();

        assert!(ids[0].starts_with("call_"));
        assert_eq!(ids[1], "dup");
        assert_ne!(ids[2], "dup");
        assert_ne!(ids[3], "old");
        let unique: HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn malformed_arguments_are_kept_raw() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, Some("x".into()), Some("a.b".into()), Some("{\"path\": ".into()));
        let calls = acc.finish(&HashSet::new());
        assert_eq!(calls[0].request.arguments, json!("{\"path\":"));
        assert!(calls[0].parse_error.is_some());
    }
}
