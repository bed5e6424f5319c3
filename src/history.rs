use crate::message::Message;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HistoryRole {
    User,
    Assistant,
}

/// One displayed chat bubble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HistoryEntry {
    pub(crate) role: HistoryRole,
    pub(crate) title: Option<String>,
    pub(crate) content: String,
}

/// Groups a stored transcript for display.
///
/// Consecutive tool calls collapse into one assistant entry listing each call's input and the
/// matching output. System messages are not shown.
pub(crate) fn render_history(messages: &[Message]) -> Vec<HistoryEntry> {
    let mut entries: Vec<HistoryEntry> = Vec::new();
    // Index of the tool entry collecting the current run of calls.
    let mut tool_entry: Option<usize> = None;

    for message in messages {
        match message {
            Message::Human { text } => {
                entries.push(HistoryEntry {
                    role: HistoryRole::User,
                    title: None,
                    content: text.clone(),
                });
                tool_entry = None;
            }
            Message::Assistant { tool_calls, .. } if !tool_calls.is_empty() => {
                let idx = *tool_entry.get_or_insert_with(|| {
                    entries.push(HistoryEntry {
                        role: HistoryRole::Assistant,
                        title: None,
                        content: String::new(),
                    });
                    entries.len() - 1
                });
                let entry = &mut entries[idx];
                for call in tool_calls {
                    if !entry.content.is_empty() {
                        entry.content.push('\n');
                    }
                    entry.content.push_str("Input: ");
                    entry.content.push_str(&pretty(&call.arguments));
                    entry.title = Some(format!("Invoking {}", call.name));
                }
            }
            Message::Assistant { text, .. } => {
                if !text.trim().is_empty() {
                    entries.push(HistoryEntry {
                        role: HistoryRole::Assistant,
                        title: None,
                        content: text.clone(),
                    });
                }
                tool_entry = None;
            }
            Message::ToolResult { content, .. } => {
                if let Some(idx) = tool_entry {
                    let entry = &mut entries[idx];
                    entry.content.push_str("\nOutput: ");
                    entry.content.push_str(&pretty(content));
                }
            }
            Message::System { .. } => {}
        }
    }
    entries
}

/// Pretty-prints JSON text; anything else is returned as is.
fn pretty(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => {
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string())
        }
        _ => text.to_string(),
    }
}

pub(crate) fn format_history(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let role = match entry.role {
                HistoryRole::User => "user",
                HistoryRole::Assistant => "assistant",
            };
            match &entry.title {
                Some(title) => format!("{role} [{title}]:\n{}", entry.content),
                None => format!("{role}:\n{}", entry.content),
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    #[test]
    fn groups_tool_calls_with_their_outputs() {
        let messages = vec![
            Message::system("hidden"),
            Message::human("what is 6*7?"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall::new("t1", "calculator", r#"{"expression":"6*7"}"#)],
            ),
            Message::tool_result("t1", "42"),
            Message::assistant("It is 42."),
        ];
        let entries = render_history(&messages);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].role, HistoryRole::User);
        assert_eq!(entries[1].title.as_deref(), Some("Invoking calculator"));
        assert_eq!(
            entries[1].content,
            "Input: {\n  \"expression\": \"6*7\"\n}\nOutput: 42"
        );
        assert_eq!(entries[2].content, "It is 42.");

        let printed = format_history(&entries);
        assert!(printed.starts_with("user:\nwhat is 6*7?\n\nassistant [Invoking calculator]:"));
    }

    #[test]
    fn consecutive_calls_share_one_entry() {
        let messages = vec![
            Message::human("q"),
            Message::assistant_with_calls("", vec![ToolCall::new("a", "calculator", "{}")]),
            Message::tool_result("a", r#"{"error":"bad"}"#),
            Message::assistant_with_calls("", vec![ToolCall::new("b", "text_analysis", "{}")]),
            Message::tool_result("b", "text"),
        ];
        let entries = render_history(&messages);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].title.as_deref(), Some("Invoking text_analysis"));
        assert!(entries[1].content.contains("\"error\": \"bad\""));
        assert!(entries[1].content.ends_with("Output: text"));
    }
}
