//! Conversation messages as stored per thread and handed to the model.

use serde::{Deserialize, Serialize};

/// A tool invocation emitted by the assistant. `arguments` is the raw JSON string the model sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    Human {
        text: String,
    },
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
    System {
        text: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Human,
    Assistant,
    ToolResult,
    System,
}

impl Message {
    pub fn human(text: impl Into<String>) -> Self {
        Message::Human { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            text: text.into(),
            tool_calls,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Message::System { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Human { .. } => MessageKind::Human,
            Message::Assistant { .. } => MessageKind::Assistant,
            Message::ToolResult { .. } => MessageKind::ToolResult,
            Message::System { .. } => MessageKind::System,
        }
    }

    pub fn is_human(&self) -> bool {
        self.kind() == MessageKind::Human
    }

    pub fn is_tool_result(&self) -> bool {
        self.kind() == MessageKind::ToolResult
    }

    pub fn is_system(&self) -> bool {
        self.kind() == MessageKind::System
    }

    /// Tool calls of an assistant message; empty for every other kind.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }

    pub fn tool_call_ids(&self) -> impl Iterator<Item = &str> {
        self.tool_calls().iter().map(|call| call.id.as_str())
    }

    /// The call id a tool result answers.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Message::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Text body of the message (tool output for tool results).
    pub fn text(&self) -> &str {
        match self {
            Message::Human { text } | Message::Assistant { text, .. } | Message::System { text } => {
                text
            }
            Message::ToolResult { content, .. } => content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_variants() {
        let call = ToolCall::new("t1", "calculator", r#"{"expression":"1+1"}"#);
        let assistant = Message::assistant_with_calls("", vec![call]);
        assert_eq!(assistant.kind(), MessageKind::Assistant);
        assert!(assistant.has_tool_calls());
        assert_eq!(assistant.tool_call_ids().collect::<Vec<_>>(), vec!["t1"]);
        assert_eq!(assistant.tool_call_id(), None);

        let result = Message::tool_result("t1", "2");
        assert!(result.is_tool_result());
        assert_eq!(result.tool_call_id(), Some("t1"));
        assert_eq!(result.text(), "2");

        assert!(!Message::assistant("hello").has_tool_calls());
        assert!(Message::human("hi").is_human());
        assert!(Message::system("be brief").is_system());
    }

    #[test]
    fn serializes_with_role_tag() {
        let value = serde_json::to_value(Message::human("hi")).unwrap();
        assert_eq!(value, json!({"role": "human", "text": "hi"}));

        // Plain assistant messages omit the empty call list and read back without it.
        let value = serde_json::to_value(Message::assistant("ok")).unwrap();
        assert_eq!(value, json!({"role": "assistant", "text": "ok"}));
        let parsed: Message = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, Message::assistant("ok"));
    }
}
