//! Tool-call integrity repair.
//!
//! Trimming a transcript by size can cut through an assistant tool-call message and the tool
//! results that answer it. Sending such a transcript to a model either dangles a call id or
//! trips strict request validation, so every trimmed view goes through [`repair_tool_calls`].

use crate::message::Message;
use std::collections::HashSet;
use std::fmt;

/// A structural problem found (and removed) while repairing a transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// An assistant message whose calls were not all answered by the tool results right after it.
    /// The message and that whole run of results were dropped.
    IncompleteToolCalls {
        missing: Vec<String>,
        dropped_results: usize,
    },
    /// An assistant message reused a call id already emitted earlier in the transcript.
    /// The message and its run of results were dropped.
    DuplicateToolCallId {
        ids: Vec<String>,
        dropped_results: usize,
    },
    /// A tool result with no kept assistant call to answer.
    OrphanedToolResult { tool_call_id: String },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::IncompleteToolCalls {
                missing,
                dropped_results,
            } => write!(
                f,
                "dropped assistant message with unanswered tool calls [{}] and {} tool result(s)",
                missing.join(", "),
                dropped_results
            ),
            Anomaly::DuplicateToolCallId {
                ids,
                dropped_results,
            } => write!(
                f,
                "dropped assistant message reusing tool call id(s) [{}] and {} tool result(s)",
                ids.join(", "),
                dropped_results
            ),
            Anomaly::OrphanedToolResult { tool_call_id } => {
                write!(f, "dropped orphaned tool result for call {}", tool_call_id)
            }
        }
    }
}

/// Output of [`repair_tool_calls`]: the kept messages plus what was removed and why.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Repair {
    pub messages: Vec<Message>,
    pub anomalies: Vec<Anomaly>,
}

impl Repair {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Drops incomplete assistant tool-call messages and orphaned tool results in one pass.
///
/// An assistant message with calls is kept only when the contiguous run of tool results that
/// follows it answers every one of its call ids. Any other tool result, inside such a run or not,
/// is kept only when its id was answered by an assistant message already kept, and is otherwise
/// dropped as an orphan. Everything else passes through in order.
pub fn repair_tool_calls(messages: &[Message]) -> Repair {
    let mut kept = Vec::with_capacity(messages.len());
    let mut anomalies = Vec::new();
    // Ids answered by kept assistant messages.
    let mut answered: HashSet<&str> = HashSet::new();
    // Every id emitted so far, kept or not; reuse is a collision.
    let mut emitted: HashSet<&str> = HashSet::new();

    let mut i = 0;
    while i < messages.len() {
        let message = &messages[i];
        match message {
            Message::Assistant { tool_calls, .. } if !tool_calls.is_empty() => {
                let run_end = messages[i + 1..]
                    .iter()
                    .position(|m| !m.is_tool_result())
                    .map_or(messages.len(), |offset| i + 1 + offset);
                let run = &messages[i + 1..run_end];

                let mut collisions = Vec::new();
                for id in message.tool_call_ids() {
                    if !emitted.insert(id) {
                        collisions.push(id.to_string());
                    }
                }

                if !collisions.is_empty() {
                    anomalies.push(Anomaly::DuplicateToolCallId {
                        ids: collisions,
                        dropped_results: run.len(),
                    });
                } else {
                    let found: HashSet<&str> = run.iter().filter_map(Message::tool_call_id).collect();
                    let missing: Vec<String> = message
                        .tool_call_ids()
                        .filter(|id| !found.contains(id))
                        .map(str::to_string)
                        .collect();

                    if missing.is_empty() {
                        let expected: HashSet<&str> = message.tool_call_ids().collect();
                        kept.push(message.clone());
                        for result in run {
                            match result.tool_call_id() {
                                Some(id) if expected.contains(id) || answered.contains(id) => {
                                    kept.push(result.clone())
                                }
                                Some(id) => anomalies.push(Anomaly::OrphanedToolResult {
                                    tool_call_id: id.to_string(),
                                }),
                                None => {}
                            }
                        }
                        answered.extend(expected);
                    } else {
                        anomalies.push(Anomaly::IncompleteToolCalls {
                            missing,
                            dropped_results: run.len(),
                        });
                    }
                }
                i = run_end;
            }
            Message::ToolResult { tool_call_id, .. } => {
                if answered.contains(tool_call_id.as_str()) {
                    kept.push(message.clone());
                } else {
                    anomalies.push(Anomaly::OrphanedToolResult {
                        tool_call_id: tool_call_id.clone(),
                    });
                }
                i += 1;
            }
            Message::Human { .. } | Message::Assistant { .. } | Message::System { .. } => {
                kept.push(message.clone());
                i += 1;
            }
        }
    }

    Repair {
        messages: kept,
        anomalies,
    }
}

/// [`repair_tool_calls`] that reports each anomaly as a warning and returns only the messages.
pub fn filter_tool_calls(messages: &[Message]) -> Vec<Message> {
    let repair = repair_tool_calls(messages);
    for anomaly in &repair.anomalies {
        tracing::warn!(%anomaly, "repaired transcript");
    }
    repair.messages
}
