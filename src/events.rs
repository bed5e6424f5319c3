use anyhow::Result;
use serde::Serialize;
use std::io::Write;

/// Progress of a running turn, emitted at step boundaries.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        success: bool,
    },
    Warning {
        message: String,
    },
}

pub(crate) trait EventSink {
    fn emit(&mut self, event: &AgentEvent) -> Result<()>;
}

/// Prints tool activity and warnings to stderr; the final answer goes to stdout elsewhere.
pub(crate) struct ConsoleSink<W: Write> {
    out: W,
}

impl ConsoleSink<std::io::Stderr> {
    pub(crate) fn stderr() -> Self {
        Self {
            out: std::io::stderr(),
        }
    }
}

impl<W: Write> ConsoleSink<W> {
    #[cfg(test)]
    fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventSink for ConsoleSink<W> {
    fn emit(&mut self, event: &AgentEvent) -> Result<()> {
        match event {
            AgentEvent::TextDelta { .. } => {}
            AgentEvent::ToolCallStarted {
                name, arguments, ..
            } => writeln!(self.out, "> invoking {name} {arguments}")?,
            AgentEvent::ToolCallFinished {
                name,
                output,
                success,
                ..
            } => {
                let (first_line, _) = output.split_once('\n').unwrap_or((output.as_str(), ""));
                let status = if *success { "done" } else { "failed" };
                writeln!(self.out, "< {name} {status}: {first_line}")?;
            }
            AgentEvent::Warning { message } => writeln!(self.out, "warning: {message}")?,
        }
        Ok(())
    }
}
