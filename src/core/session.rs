use crate::core::message::{Message, NewMessage, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const PREVIEW_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(id: impl Into<String>, bot_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            bot_id,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.messages.len() as u64
    }

    /// Checks that `draft` may be appended: role-specific fields line up,
    /// tool-call ids are unique within the session, and a tool result
    /// answers exactly one earlier request that has no answer yet.
    pub fn validate_append(&self, draft: &NewMessage) -> Result<(), String> {
        match draft.role {
            Role::User => {
                if !draft.tool_calls.is_empty() || draft.tool_result.is_some() {
                    return Err("user messages cannot carry tool calls or results".to_string());
                }
            }
            Role::Assistant => {
                if draft.tool_result.is_some() {
                    return Err("assistant messages cannot carry a tool result".to_string());
                }
                let known = self.requested_call_ids();
                let mut fresh = HashSet::new();
                for call in &draft.tool_calls {
                    if call.id.is_empty() {
                        return Err("tool call id must not be empty".to_string());
                    }
                    if known.contains(call.id.as_str()) || !fresh.insert(call.id.as_str()) {
                        return Err(format!("duplicate tool call id '{}'", call.id));
                    }
                }
            }
            Role::Tool => {
                if !draft.tool_calls.is_empty() {
                    return Err("tool messages cannot carry tool calls".to_string());
                }
                let Some(result) = &draft.tool_result else {
                    return Err("tool messages must carry a tool result".to_string());
                };
                if !self.requested_call_ids().contains(result.call_id.as_str()) {
                    return Err(format!(
                        "tool result references unknown call '{}'",
                        result.call_id
                    ));
                }
                if self.answered_call_ids().contains(result.call_id.as_str()) {
                    return Err(format!("tool call '{}' already answered", result.call_id));
                }
            }
        }
        Ok(())
    }

    pub fn requested_call_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .flat_map(|message| message.tool_calls.iter())
            .map(|call| call.id.as_str())
            .collect()
    }

    pub fn answered_call_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .filter_map(|message| message.tool_result.as_ref())
            .map(|result| result.call_id.as_str())
            .collect()
    }

    /// Ids of requested calls that have no result, in request order.
    pub fn unanswered_call_ids(&self) -> Vec<String> {
        let answered = self.answered_call_ids();
        self.messages
            .iter()
            .flat_map(|message| message.tool_calls.iter())
            .filter(|call| !answered.contains(call.id.as_str()))
            .map(|call| call.id.clone())
            .collect()
    }

    /// Validates a whole message sequence, as received by import or read
    /// back from disk.
    pub fn validate_history(&self) -> Result<(), String> {
        let mut replay = Session {
            messages: Vec::with_capacity(self.messages.len()),
            ..self.clone()
        };
        for (index, message) in self.messages.iter().enumerate() {
            if message.seq != index as u64 {
                return Err(format!(
                    "message {index} has seq {} (expected {index})",
                    message.seq
                ));
            }
            let draft = NewMessage {
                role: message.role,
                text: message.text.clone(),
                tool_calls: message.tool_calls.clone(),
                tool_result: message.tool_result.clone(),
                model: message.model.clone(),
            };
            replay.validate_append(&draft)?;
            replay.messages.push(message.clone());
        }
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        let preview = self
            .messages
            .iter()
            .find(|message| message.is_user())
            .map(|message| preview_text(&message.text))
            .unwrap_or_default();
        SessionSummary {
            id: self.id.clone(),
            bot_id: self.bot_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            preview,
        }
    }

    pub fn matches(&self, filter: &SessionFilter) -> bool {
        if let Some(bot_id) = &filter.bot_id {
            if self.bot_id.as_deref() != Some(bot_id.as_str()) {
                return false;
            }
        }
        if let Some(keyword) = filter.keyword.as_deref().filter(|k| !k.is_empty()) {
            let needle = keyword.to_lowercase();
            return self
                .messages
                .iter()
                .any(|message| message.text.to_lowercase().contains(&needle));
        }
        true
    }
}

fn preview_text(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= PREVIEW_CHARS {
        single_line
    } else {
        let truncated: String = single_line.chars().take(PREVIEW_CHARS).collect();
        format!("{truncated}…")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub bot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub preview: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub bot_id: Option<String>,
    /// Case-insensitive substring matched against message text
    pub keyword: Option<String>,
    pub limit: Option<usize>,
}

/// Sorts most recently updated first and applies the limit.
pub fn finish_listing(mut summaries: Vec<SessionSummary>, limit: Option<usize>) -> Vec<SessionSummary> {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(limit) = limit {
        summaries.truncate(limit);
    }
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{ToolCallRequest, ToolCallResult, ToolFailureKind};
    use serde_json::json;

    fn push(session: &mut Session, draft: NewMessage) {
        session.validate_append(&draft).expect("valid append");
        let message = draft.into_message(session.next_seq(), Utc::now());
        session.messages.push(message);
    }

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: "fs.read".to_string(),
            arguments: json!({}),
        }
    }

    #[test]
    fn tool_result_must_reference_prior_request() {
        let session = Session::new("s1", None);
        let draft = NewMessage::tool(ToolCallResult::success("nope", "x"));
        let err = session.validate_append(&draft).unwrap_err();
        assert!(err.contains("unknown call"));
    }

    #[test]
    fn each_request_is_answered_at_most_once() {
        let mut session = Session::new("s1", None);
        push(&mut session, NewMessage::user("hi"));
        push(
            &mut session,
            NewMessage::assistant("", vec![call("a")], None),
        );
        push(&mut session, NewMessage::tool(ToolCallResult::success("a", "ok")));

        let again = NewMessage::tool(ToolCallResult::failure(
            "a",
            ToolFailureKind::Timeout,
            "late",
        ));
        assert!(session.validate_append(&again).unwrap_err().contains("already answered"));
    }

    #[test]
    fn unanswered_calls_keep_request_order() {
        let mut session = Session::new("s1", None);
        push(
            &mut session,
            NewMessage::assistant("", vec![call("c"), call("a"), call("b")], None),
        );
        push(&mut session, NewMessage::tool(ToolCallResult::success("a", "ok")));
        assert_eq!(session.unanswered_call_ids(), vec!["c", "b"]);
    }

    #[test]
    fn duplicate_call_ids_are_rejected_across_messages() {
        let mut session = Session::new("s1", None);
        push(
            &mut session,
            NewMessage::assistant("", vec![call("a")], None),
        );
        let dup = NewMessage::assistant("", vec![call("a")], None);
        assert!(session.validate_append(&dup).is_err());
        let dup_in_one = NewMessage::assistant("", vec![call("b"), call("b")], None);
        assert!(session.validate_append(&dup_in_one).is_err());
    }

    #[test]
    fn validate_history_checks_sequence_numbers() {
        let mut session = Session::new("s1", None);
        push(&mut session, NewMessage::user("one"));
        push(&mut session, NewMessage::user("two"));
        assert!(session.validate_history().is_ok());

        session.messages[1].seq = 5;
        assert!(session.validate_history().is_err());
    }

    #[test]
    fn keyword_filter_is_case_insensitive() {
        let mut session = Session::new("s1", Some("helper".to_string()));
        push(&mut session, NewMessage::user("Deploy the Rocket"));

        let by_keyword = SessionFilter {
            keyword: Some("rocket".to_string()),
            ..Default::default()
        };
        assert!(session.matches(&by_keyword));

        let wrong_bot = SessionFilter {
            bot_id: Some("other".to_string()),
            ..Default::default()
        };
        assert!(!session.matches(&wrong_bot));
    }

    #[test]
    fn summary_previews_first_user_message() {
        let mut session = Session::new("s1", None);
        push(&mut session, NewMessage::user("first\nline"));
        push(&mut session, NewMessage::user("second"));
        let summary = session.summary();
        assert_eq!(summary.preview, "first line");
        assert_eq!(summary.message_count, 2);
    }
}
