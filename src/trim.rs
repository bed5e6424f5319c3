//! Bounded views of a conversation: one for the model, one for persisted state.

use crate::integrity::filter_tool_calls;
use crate::message::Message;
use anyhow::{bail, Result};

pub const DEFAULT_MAX_MODEL_MESSAGES: usize = 15;
pub const DEFAULT_MAX_STORED_MESSAGES: usize = 50;

/// How much of a budget one message uses.
pub trait SizeMetric: Send + Sync {
    fn cost(&self, message: &Message) -> usize;

    fn measure(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.cost(m)).sum()
    }
}

/// Every message costs one unit, so budgets are message counts.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageCount;

impl SizeMetric for MessageCount {
    fn cost(&self, _message: &Message) -> usize {
        1
    }
}

/// Rough token estimate at ~4 characters per token, never less than one per message.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApproxTokens;

const CHARS_PER_TOKEN: usize = 4;

impl SizeMetric for ApproxTokens {
    fn cost(&self, message: &Message) -> usize {
        let call_chars: usize = message
            .tool_calls()
            .iter()
            .map(|call| call.name.len() + call.arguments.len())
            .sum();
        let chars = message.text().len() + call_chars;
        (chars / CHARS_PER_TOKEN).max(1)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SizeMetricKind {
    #[default]
    Messages,
    ApproxTokens,
}

impl SizeMetricKind {
    pub fn metric(self) -> &'static dyn SizeMetric {
        match self {
            SizeMetricKind::Messages => &MessageCount,
            SizeMetricKind::ApproxTokens => &ApproxTokens,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimConfig {
    /// Budget for the view sent to the model on every call.
    pub max_model_messages: usize,
    /// Budget for the transcript kept in the store between turns.
    pub max_stored_messages: usize,
    pub metric: SizeMetricKind,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            max_model_messages: DEFAULT_MAX_MODEL_MESSAGES,
            max_stored_messages: DEFAULT_MAX_STORED_MESSAGES,
            metric: SizeMetricKind::default(),
        }
    }
}

impl TrimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_model_messages == 0 || self.max_stored_messages == 0 {
            bail!("trim budgets must be positive");
        }
        if self.max_model_messages > self.max_stored_messages {
            bail!(
                "model budget ({}) must not exceed stored budget ({})",
                self.max_model_messages,
                self.max_stored_messages
            );
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryTrimmer {
    config: TrimConfig,
}

impl HistoryTrimmer {
    pub fn new(config: TrimConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrimConfig {
        &self.config
    }

    /// Model-input view under the configured model budget.
    pub fn for_model(&self, messages: &[Message]) -> Vec<Message> {
        self.for_model_within(messages, self.config.max_model_messages)
    }

    /// Model-input view under an explicit budget.
    ///
    /// Keeps the most recent messages that fit, starting on a human message and ending on a
    /// human message or tool result. A leading system message is kept in front of the window and
    /// counts against the budget. Returns an empty view when no human message fits.
    pub fn for_model_within(&self, messages: &[Message], budget: usize) -> Vec<Message> {
        let metric = self.config.metric.metric();
        let messages = &messages[..end_anchor(messages)];
        let prefix_len = usize::from(messages.first().is_some_and(Message::is_system));
        let (prefix, body) = messages.split_at(prefix_len);

        let mut remaining = budget.saturating_sub(metric.measure(prefix));
        let mut start = body.len();
        while start > 0 {
            let cost = metric.cost(&body[start - 1]);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            start -= 1;
        }
        while start < body.len() && !body[start].is_human() {
            start += 1;
        }
        if start == body.len() {
            return Vec::new();
        }

        let mut window = prefix.to_vec();
        window.extend_from_slice(&body[start..]);
        let mut window = filter_tool_calls(&window);
        // Repair can drop a trailing pair and expose a plain assistant reply.
        window.truncate(end_anchor(&window));
        window
    }

    /// Model-input view for a turn whose own tool rounds crowd its human message out of the
    /// budget.
    ///
    /// Keeps the human message at `turn_start` and the most recent later messages that fit the
    /// rest of the budget, repaired and end-anchored like [`Self::for_model_within`]. Empty when
    /// `turn_start` is not a human message or that message alone does not fit.
    pub fn for_turn_within(
        &self,
        messages: &[Message],
        turn_start: usize,
        budget: usize,
    ) -> Vec<Message> {
        let metric = self.config.metric.metric();
        let Some(human) = messages.get(turn_start).filter(|m| m.is_human()) else {
            return Vec::new();
        };
        let Some(mut remaining) = budget.checked_sub(metric.cost(human)) else {
            return Vec::new();
        };
        let rest = &messages[turn_start + 1..end_anchor(messages)];

        let mut start = rest.len();
        while start > 0 {
            let cost = metric.cost(&rest[start - 1]);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            start -= 1;
        }

        let mut window = vec![human.clone()];
        window.extend_from_slice(&rest[start..]);
        let mut window = filter_tool_calls(&window);
        window.truncate(end_anchor(&window));
        window
    }

    /// Persisted view: the transcript itself when it fits, otherwise its pruned form.
    pub fn for_storage(&self, messages: &[Message]) -> Vec<Message> {
        self.for_storage_update(messages)
            .unwrap_or_else(|| messages.to_vec())
    }

    /// Pruned transcript to write back in full, or `None` when it already fits the stored budget.
    ///
    /// System messages are kept wherever they sit; the rest of the budget goes to the most recent
    /// other messages.
    pub fn for_storage_update(&self, messages: &[Message]) -> Option<Vec<Message>> {
        let metric = self.config.metric.metric();
        let budget = self.config.max_stored_messages;
        if metric.measure(messages) <= budget {
            return None;
        }

        let mut keep: Vec<bool> = messages.iter().map(Message::is_system).collect();
        let system_cost: usize = messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| metric.cost(m))
            .sum();
        let mut remaining = budget.saturating_sub(system_cost);
        for (idx, message) in messages.iter().enumerate().rev() {
            if message.is_system() {
                continue;
            }
            let cost = metric.cost(message);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            keep[idx] = true;
        }

        let kept: Vec<Message> = messages
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| **keep)
            .map(|(message, _)| message.clone())
            .collect();
        Some(filter_tool_calls(&kept))
    }
}

/// Length of the longest prefix ending on a human message or tool result.
fn end_anchor(messages: &[Message]) -> usize {
    messages
        .iter()
        .rposition(|m| m.is_human() || m.is_tool_result())
        .map_or(0, |idx| idx + 1)
}
