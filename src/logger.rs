use crate::events::{AgentEvent, EventSink};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::rc::Rc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// JSONL session log. Clones share the same writers.
#[derive(Clone)]
pub(crate) struct Logger {
    inner: Rc<RefCell<LoggerInner>>,
}

struct LoggerInner {
    file_writer: Option<BufWriter<File>>,
    stdout_writer: Option<BufWriter<std::io::Stdout>>,
    buffer: Option<Vec<Value>>,
    next_item_id: u64,
}

impl Logger {
    pub(crate) fn new(
        log_path: Option<PathBuf>,
        stream_to_stdout: bool,
        buffer_for_stdout: bool,
    ) -> Result<Self> {
        let file_writer = if let Some(log_path) = log_path {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory {}", parent.display())
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&log_path)
                .with_context(|| format!("failed to create log file {}", log_path.display()))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        let stdout_writer = stream_to_stdout.then(|| BufWriter::new(std::io::stdout()));
        let buffer = buffer_for_stdout.then(Vec::new);

        Ok(Self {
            inner: Rc::new(RefCell::new(LoggerInner {
                file_writer,
                stdout_writer,
                buffer,
                next_item_id: 0,
            })),
        })
    }

    /// Logger that only buffers; used where no log destination was requested.
    #[cfg(test)]
    pub(crate) fn buffered() -> Self {
        Self {
            inner: Rc::new(RefCell::new(LoggerInner {
                file_writer: None,
                stdout_writer: None,
                buffer: Some(Vec::new()),
                next_item_id: 0,
            })),
        }
    }

    pub(crate) fn log_event(&self, event: &Value) -> Result<()> {
        let mut enriched = event.clone();
        if let Value::Object(obj) = &mut enriched {
            // Human-readable UTC timestamp plus a numeric one for sorting.
            let now = OffsetDateTime::now_utc();
            let ts_ms = now.unix_timestamp_nanos() / 1_000_000;
            obj.entry("timestamp_ms").or_insert_with(|| json!(ts_ms));
            obj.entry("timestamp").or_insert_with(|| {
                json!(now.format(&Rfc3339).unwrap_or_else(|_| ts_ms.to_string()))
            });
        }
        let mut inner = self.inner.borrow_mut();

        if let Some(buf) = inner.buffer.as_mut() {
            buf.push(enriched.clone());
        }

        if let Some(w) = inner.file_writer.as_mut() {
            write_line(w, &enriched)?;
            w.flush()?;
        }
        if let Some(w) = inner.stdout_writer.as_mut() {
            write_line(w, &enriched)?;
            w.flush()?;
        }
        Ok(())
    }

    pub(crate) fn next_item_id(&self) -> String {
        let mut inner = self.inner.borrow_mut();
        let id = format!("item_{}", inner.next_item_id);
        inner.next_item_id += 1;
        id
    }

    pub(crate) fn emit_buffer_to_stdout(&self) -> Result<()> {
        let inner = self.inner.borrow();
        let Some(buf) = inner.buffer.as_ref() else {
            return Ok(());
        };
        let mut out = BufWriter::new(std::io::stdout());
        for event in buf {
            write_line(&mut out, event)?;
        }
        out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn buffered_events(&self) -> Vec<Value> {
        self.inner.borrow().buffer.clone().unwrap_or_default()
    }
}

fn write_line(out: &mut impl Write, event: &Value) -> Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    Ok(())
}

impl EventSink for Logger {
    fn emit(&mut self, event: &AgentEvent) -> Result<()> {
        let (phase, item) = match event {
            AgentEvent::TextDelta { text } => (
                "item.completed",
                json!({"id": self.next_item_id(), "type": "agent_message", "text": text}),
            ),
            AgentEvent::ToolCallStarted {
                call_id,
                name,
                arguments,
            } => (
                "item.started",
                json!({
                    "id": call_id,
                    "type": "tool_call",
                    "name": name,
                    "arguments": arguments,
                    "status": "in_progress",
                }),
            ),
            AgentEvent::ToolCallFinished {
                call_id,
                name,
                output,
                success,
            } => (
                "item.completed",
                json!({
                    "id": call_id,
                    "type": "tool_call",
                    "name": name,
                    "output": output,
                    "status": if *success { "completed" } else { "failed" },
                }),
            ),
            AgentEvent::Warning { message } => (
                "item.completed",
                json!({"id": self.next_item_id(), "type": "error", "message": message}),
            ),
        };
        self.log_event(&json!({"type": phase, "item": item}))
    }
}
