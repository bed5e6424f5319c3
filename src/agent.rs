use crate::client::{is_context_error, ChatClient};
use crate::config::Settings;
use crate::events::{AgentEvent, EventSink};
use crate::integrity::repair_tool_calls;
use crate::logger::Logger;
use crate::message::{Message, ToolCall};
use crate::profiles::Profile;
use crate::prompt::build_system_prompt;
use crate::protocol::{wire_message, CompletionResult, TokenUsage};
use crate::store::TranscriptStore;
use crate::tools::{build_tools, execute_tool, tool_error};
use crate::trim::HistoryTrimmer;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Cooperative cancellation, checked before every model call and between tool calls.
#[derive(Clone, Default)]
pub(crate) struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancels from a background timer once `limit` has elapsed.
    pub(crate) fn cancel_after(&self, limit: Duration) {
        let flag = self.clone();
        thread::spawn(move || {
            thread::sleep(limit);
            flag.cancel();
        });
    }
}

pub(crate) struct Agent {
    client: ChatClient,
    model: String,
    temperature: f64,
    profile: &'static Profile,
    system_prompt: String,
    tools: Vec<Value>,
    thread_id: String,
    trimmer: HistoryTrimmer,
    store: Arc<dyn TranscriptStore>,
    max_steps: Option<usize>,
    max_tool_output_chars: usize,
    logger: Logger,
    sinks: Vec<Box<dyn EventSink>>,
    cancel: CancelFlag,
    token_usage_total: TokenUsage,
}

impl Agent {
    pub(crate) fn new(
        settings: &Settings,
        client: ChatClient,
        store: Arc<dyn TranscriptStore>,
        logger: Logger,
    ) -> Self {
        Self {
            client,
            model: settings.model.clone(),
            temperature: settings.temperature,
            profile: settings.profile,
            system_prompt: build_system_prompt(settings.profile),
            tools: build_tools(settings.profile.tools),
            thread_id: settings.thread_id.clone(),
            trimmer: HistoryTrimmer::new(settings.trim),
            store,
            max_steps: settings.max_steps,
            max_tool_output_chars: settings.max_tool_output_chars,
            logger,
            sinks: Vec::new(),
            cancel: CancelFlag::default(),
            token_usage_total: TokenUsage::default(),
        }
    }

    /// Adds a sink that receives every event alongside the JSONL log.
    pub(crate) fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub(crate) fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Runs one human turn on the agent's thread and returns the final answer.
    ///
    /// The transcript is written back through `for_storage` whether the turn succeeds or not.
    pub(crate) fn run_turn(&mut self, text: &str) -> Result<String> {
        let mut transcript = self.load_transcript()?;
        self.log_thread_started()?;
        self.log_turn_started(text)?;

        transcript.push(Message::human(text));
        let outcome = self.run_steps(&mut transcript);
        let persisted = self.persist(&transcript);

        match outcome.and_then(|answer| persisted.map(|()| answer)) {
            Ok(answer) => {
                self.log_turn_completed()?;
                Ok(answer)
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.log_error_event(&message)?;
                self.log_turn_failed(&message)?;
                Err(err)
            }
        }
    }

    fn load_transcript(&self) -> Result<Vec<Message>> {
        let stored = self
            .store
            .load(&self.thread_id)
            .with_context(|| format!("failed to load thread {}", self.thread_id))?;
        let repair = repair_tool_calls(&stored);
        if !repair.is_clean() {
            let anomalies: Vec<String> = repair.anomalies.iter().map(ToString::to_string).collect();
            self.logger.log_event(&json!({
                "type": "transcript.repaired",
                "thread_id": self.thread_id,
                "anomalies": anomalies,
            }))?;
        }
        Ok(repair.messages)
    }

    fn run_steps(&mut self, transcript: &mut Vec<Message>) -> Result<String> {
        let turn_start = transcript.len().saturating_sub(1);
        let mut steps = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                let message = "Terminated: cancelled.".to_string();
                self.emit(AgentEvent::Warning {
                    message: message.clone(),
                })?;
                return Ok(message);
            }
            if let Some(max_steps) = self.max_steps {
                if steps >= max_steps {
                    let message = format!("Terminated: max_steps ({}) reached.", max_steps);
                    self.emit(AgentEvent::Warning {
                        message: message.clone(),
                    })?;
                    return Ok(message);
                }
            }

            steps += 1;
            let completion = self.complete(transcript, turn_start)?;
            if let Some(usage) = &completion.usage {
                self.token_usage_total.add_usage(usage);
            }

            let assistant = completion.message.into_message();
            let text = assistant.text().to_string();
            if !text.trim().is_empty() {
                self.emit(AgentEvent::TextDelta { text: text.clone() })?;
            }
            let tool_calls = assistant.tool_calls().to_vec();
            transcript.push(assistant);
            if tool_calls.is_empty() {
                return Ok(text);
            }

            for tool_call in &tool_calls {
                let content = if self.cancel.is_cancelled() {
                    // Still answered so the stored call stays paired.
                    tool_error("cancelled".to_string())
                } else {
                    self.run_tool(tool_call)?
                };
                transcript.push(Message::tool_result(&tool_call.id, content));
            }
        }
    }

    /// One completion over the model view of `transcript`, shrinking the view when the provider
    /// reports a context-length overflow.
    ///
    /// When the current turn's tool rounds push its human message out of the view, the view is
    /// rebuilt from that message instead.
    fn complete(&mut self, transcript: &[Message], turn_start: usize) -> Result<CompletionResult> {
        let mut budget = self.trimmer.config().max_model_messages;
        loop {
            let mut window = self.trimmer.for_model_within(transcript, budget);
            if window.is_empty() {
                window = self.trimmer.for_turn_within(transcript, turn_start, budget);
            }
            if window.is_empty() {
                bail!(
                    "no human message fits the model history budget ({})",
                    budget
                );
            }
            let request = self.build_request(&window);
            match self.client.complete(&request) {
                Ok(result) => return Ok(result),
                Err(err) if budget > 1 && is_context_error(&format!("{err:#}")) => {
                    budget = (budget / 2).max(1);
                    self.emit(AgentEvent::Warning {
                        message: format!(
                            "context length exceeded; retrying with a model history budget of {}",
                            budget
                        ),
                    })?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_tool(&mut self, tool_call: &ToolCall) -> Result<String> {
        self.emit(AgentEvent::ToolCallStarted {
            call_id: tool_call.id.clone(),
            name: tool_call.name.clone(),
            arguments: tool_call.arguments.clone(),
        })?;
        let result = execute_tool(tool_call, self.profile.tools, self.max_tool_output_chars);
        let (content, success) = match result {
            Ok(output) => {
                let success = !output_is_error_json(&output);
                (output, success)
            }
            Err(err) => (tool_error(format!("{err:#}")), false),
        };
        self.emit(AgentEvent::ToolCallFinished {
            call_id: tool_call.id.clone(),
            name: tool_call.name.clone(),
            output: content.clone(),
            success,
        })?;
        Ok(content)
    }

    fn build_request(&self, window: &[Message]) -> Value {
        let mut messages = vec![json!({"role": "system", "content": self.system_prompt})];
        messages.extend(window.iter().map(wire_message));
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if !self.tools.is_empty() {
            body["tools"] = json!(self.tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    fn persist(&mut self, transcript: &[Message]) -> Result<()> {
        let pruned = self.trimmer.for_storage_update(transcript);
        if let Some(pruned) = &pruned {
            self.logger.log_event(&json!({
                "type": "transcript.trimmed",
                "thread_id": self.thread_id,
                "before": transcript.len(),
                "after": pruned.len(),
            }))?;
        }
        self.store
            .replace(&self.thread_id, pruned.as_deref().unwrap_or(transcript))
            .with_context(|| format!("failed to save thread {}", self.thread_id))
    }

    fn emit(&mut self, event: AgentEvent) -> Result<()> {
        self.logger.emit(&event)?;
        for sink in &mut self.sinks {
            sink.emit(&event)?;
        }
        Ok(())
    }

    fn log_thread_started(&self) -> Result<()> {
        self.logger.log_event(&json!({
            "type": "thread.started",
            "thread_id": self.thread_id,
        }))
    }

    fn log_turn_started(&self, prompt: &str) -> Result<()> {
        self.logger.log_event(&json!({
            "type": "turn.started",
            "prompt": prompt,
            "profile": self.profile.name,
            "system_prompt": self.system_prompt,
        }))
    }

    fn log_turn_completed(&self) -> Result<()> {
        self.logger.log_event(&json!({
            "type": "turn.completed",
            "usage": self.token_usage_total,
        }))
    }

    fn log_turn_failed(&self, message: &str) -> Result<()> {
        self.logger.log_event(&json!({
            "type": "turn.failed",
            "error": { "message": message }
        }))
    }

    fn log_error_event(&self, message: &str) -> Result<()> {
        self.logger.log_event(&json!({
            "type": "error",
            "message": message,
        }))
    }
}

fn output_is_error_json(output: &str) -> bool {
    match serde_json::from_str::<Value>(output) {
        Ok(Value::Object(map)) => map.contains_key("error"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_MAX_TOOL_OUTPUT_CHARS, DEFAULT_UPLOAD_DIR};
    use crate::profiles::ProfileId;
    use crate::store::{MemoryStore, StoreConfig};
    use crate::testing::{error_response, text_completion, tool_call_completion, StubServer};
    use crate::trim::TrimConfig;
    use std::path::PathBuf;

    fn settings(base_url: &str, profile: ProfileId, trim: TrimConfig) -> Settings {
        Settings {
            model: "test/model".to_string(),
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            temperature: 0.2,
            profile: profile.profile(),
            thread_id: "thread-1".to_string(),
            trim,
            store: StoreConfig {
                path: None,
                ttl: None,
            },
            max_steps: Some(5),
            time_limit: None,
            max_tool_output_chars: DEFAULT_MAX_TOOL_OUTPUT_CHARS,
            retry_429: false,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
        }
    }

    fn build_agent(settings: &Settings, store: Arc<MemoryStore>, logger: Logger) -> Agent {
        let client = ChatClient::new(&settings.base_url, "test-key", false).unwrap();
        Agent::new(settings, client, store, logger)
    }

    fn event_types(logger: &Logger) -> Vec<String> {
        logger
            .buffered_events()
            .iter()
            .map(|event| event["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn runs_tool_calls_and_persists_the_turn() {
        let Some(server) = StubServer::start(vec![
            tool_call_completion(&[("call_1", "calculator", r#"{"expression":"6*7"}"#)]),
            text_completion("It is 42."),
        ]) else {
            return;
        };
        let settings = settings(&server.base_url, ProfileId::Tutor, TrimConfig::default());
        let store = Arc::new(MemoryStore::new());
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store.clone(), logger.clone());

        let answer = agent.run_turn("what is 6*7?").unwrap();
        assert_eq!(answer, "It is 42.");

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        let first = &requests[0];
        assert_eq!(first["messages"][0]["role"], "system");
        assert_eq!(first["messages"][1]["content"], "what is 6*7?");
        assert_eq!(first["tools"][0]["function"]["name"], "calculator");
        let second = requests[1]["messages"].as_array().unwrap();
        assert_eq!(second.last().unwrap()["role"], "tool");
        assert_eq!(second.last().unwrap()["content"], "42");

        assert_eq!(
            store.load("thread-1").unwrap(),
            vec![
                Message::human("what is 6*7?"),
                Message::assistant_with_calls(
                    "",
                    vec![ToolCall::new("call_1", "calculator", r#"{"expression":"6*7"}"#)]
                ),
                Message::tool_result("call_1", "42"),
                Message::assistant("It is 42."),
            ]
        );

        let types = event_types(&logger);
        assert_eq!(types.first().map(String::as_str), Some("thread.started"));
        assert_eq!(types.last().map(String::as_str), Some("turn.completed"));
        let events = logger.buffered_events();
        let finished = events
            .iter()
            .find(|e| e["type"] == "item.completed" && e["item"]["type"] == "tool_call")
            .unwrap();
        assert_eq!(finished["item"]["status"], "completed");
        assert_eq!(events.last().unwrap()["usage"]["input_tokens"], 6);
    }

    #[test]
    fn sends_only_the_trimmed_history_and_prunes_storage() {
        let Some(server) = StubServer::start(vec![text_completion("fine")]) else {
            return;
        };
        let trim = TrimConfig {
            max_model_messages: 3,
            max_stored_messages: 4,
            ..TrimConfig::default()
        };
        let settings = settings(&server.base_url, ProfileId::Travel, trim);
        let store = Arc::new(MemoryStore::new());
        store
            .replace(
                "thread-1",
                &[
                    Message::human("one"),
                    Message::assistant("r1"),
                    Message::human("two"),
                    Message::assistant("r2"),
                ],
            )
            .unwrap();
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store.clone(), logger.clone());

        agent.run_turn("three").unwrap();

        let requests = server.requests();
        let sent: Vec<&str> = requests[0]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .skip(1)
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(sent, vec!["two", "r2", "three"]);
        assert!(requests[0].get("tools").is_none());

        assert_eq!(
            store.load("thread-1").unwrap(),
            vec![
                Message::human("two"),
                Message::assistant("r2"),
                Message::human("three"),
                Message::assistant("fine"),
            ]
        );
    }

    #[test]
    fn logs_storage_pruning() {
        let Some(server) = StubServer::start(vec![text_completion("fine")]) else {
            return;
        };
        let trim = TrimConfig {
            max_model_messages: 2,
            max_stored_messages: 2,
            ..TrimConfig::default()
        };
        let settings = settings(&server.base_url, ProfileId::Travel, trim);
        let store = Arc::new(MemoryStore::new());
        store
            .replace("thread-1", &[Message::human("one"), Message::assistant("r1")])
            .unwrap();
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store.clone(), logger.clone());

        agent.run_turn("two").unwrap();
        server.requests();

        assert_eq!(
            store.load("thread-1").unwrap(),
            vec![Message::human("two"), Message::assistant("fine")]
        );
        let events = logger.buffered_events();
        let trimmed = events
            .iter()
            .find(|e| e["type"] == "transcript.trimmed")
            .unwrap();
        assert_eq!(trimmed["before"], 4);
        assert_eq!(trimmed["after"], 2);
    }

    #[test]
    fn halves_the_model_budget_on_context_errors() {
        let Some(server) = StubServer::start(vec![
            error_response(400, "This model's maximum context length is 8 tokens"),
            text_completion("short enough"),
        ]) else {
            return;
        };
        let trim = TrimConfig {
            max_model_messages: 5,
            max_stored_messages: 10,
            ..TrimConfig::default()
        };
        let settings = settings(&server.base_url, ProfileId::Travel, trim);
        let store = Arc::new(MemoryStore::new());
        store
            .replace(
                "thread-1",
                &[
                    Message::human("one"),
                    Message::assistant("r1"),
                    Message::human("two"),
                    Message::assistant("r2"),
                ],
            )
            .unwrap();
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store, logger.clone());

        assert_eq!(agent.run_turn("three").unwrap(), "short enough");

        let requests = server.requests();
        // System prompt plus the window.
        assert_eq!(requests[0]["messages"].as_array().unwrap().len(), 6);
        assert_eq!(requests[1]["messages"].as_array().unwrap().len(), 2);
        assert!(logger.buffered_events().iter().any(|e| e["item"]["message"]
            .as_str()
            .is_some_and(|m| m.starts_with("context length exceeded"))));
    }

    #[test]
    fn failed_turns_keep_the_human_message() {
        let Some(server) = StubServer::start(vec![error_response(401, "bad key")]) else {
            return;
        };
        let settings = settings(&server.base_url, ProfileId::Tutor, TrimConfig::default());
        let store = Arc::new(MemoryStore::new());
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store.clone(), logger.clone());

        let err = agent.run_turn("hello").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("HTTP 401"), "{message}");
        assert!(!is_context_error(&message));
        server.requests();

        assert_eq!(store.load("thread-1").unwrap(), vec![Message::human("hello")]);
        assert_eq!(
            event_types(&logger).last().map(String::as_str),
            Some("turn.failed")
        );
    }

    #[test]
    fn long_tool_turns_stay_within_the_model_budget() {
        let Some(server) = StubServer::start(vec![
            tool_call_completion(&[("c1", "calculator", r#"{"expression":"1+1"}"#)]),
            tool_call_completion(&[("c2", "calculator", r#"{"expression":"2+2"}"#)]),
            tool_call_completion(&[("c3", "calculator", r#"{"expression":"3+3"}"#)]),
            text_completion("done"),
        ]) else {
            return;
        };
        let trim = TrimConfig {
            max_model_messages: 3,
            max_stored_messages: 10,
            ..TrimConfig::default()
        };
        let settings = settings(&server.base_url, ProfileId::Tutor, trim);
        let store = Arc::new(MemoryStore::new());
        let mut agent = build_agent(&settings, store.clone(), Logger::buffered());

        assert_eq!(agent.run_turn("keep adding").unwrap(), "done");

        let requests = server.requests();
        assert_eq!(requests.len(), 4);
        for request in &requests[2..] {
            let sent = request["messages"].as_array().unwrap();
            // System prompt, the turn's human message, then the latest call and its result.
            assert_eq!(sent.len(), 4);
            assert_eq!(sent[1]["content"], "keep adding");
            assert_eq!(sent[3]["role"], "tool");
        }
        assert_eq!(requests[3]["messages"][3]["content"], "6");
        assert_eq!(store.load("thread-1").unwrap().len(), 8);
    }

    struct CancelOnToolCall(CancelFlag);

    impl EventSink for CancelOnToolCall {
        fn emit(&mut self, event: &AgentEvent) -> Result<()> {
            if matches!(event, AgentEvent::ToolCallStarted { .. }) {
                self.0.cancel();
            }
            Ok(())
        }
    }

    #[test]
    fn cancellation_answers_pending_calls() {
        let Some(server) = StubServer::start(vec![tool_call_completion(&[
            ("a", "calculator", r#"{"expression":"1+1"}"#),
            ("b", "calculator", r#"{"expression":"2+2"}"#),
        ])]) else {
            return;
        };
        let settings = settings(&server.base_url, ProfileId::Tutor, TrimConfig::default());
        let store = Arc::new(MemoryStore::new());
        let agent = build_agent(&settings, store.clone(), Logger::buffered());
        let flag = agent.cancel_flag();
        let mut agent = agent.with_sink(Box::new(CancelOnToolCall(flag)));

        assert_eq!(agent.run_turn("add").unwrap(), "Terminated: cancelled.");
        assert_eq!(server.requests().len(), 1);

        let stored = store.load("thread-1").unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[2], Message::tool_result("a", "2"));
        assert_eq!(
            stored[3],
            Message::tool_result("b", tool_error("cancelled".to_string()))
        );
    }

    #[test]
    fn unknown_tools_are_reported_to_the_model() {
        let Some(server) = StubServer::start(vec![
            tool_call_completion(&[("w", "weather", r#"{"city":"Oslo"}"#)]),
            text_completion("I cannot check the weather."),
        ]) else {
            return;
        };
        let settings = settings(&server.base_url, ProfileId::Travel, TrimConfig::default());
        let store = Arc::new(MemoryStore::new());
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store.clone(), logger.clone());

        agent.run_turn("weather in Oslo?").unwrap();
        server.requests();

        let stored = store.load("thread-1").unwrap();
        assert_eq!(
            stored[2],
            Message::tool_result("w", tool_error("Unknown tool: weather".to_string()))
        );
        let failed = logger
            .buffered_events()
            .into_iter()
            .find(|e| e["item"]["status"] == "failed")
            .unwrap();
        assert_eq!(failed["item"]["name"], "weather");
    }

    #[test]
    fn repairs_stored_transcripts_on_load() {
        let Some(server) = StubServer::start(vec![text_completion("ok")]) else {
            return;
        };
        let settings = settings(&server.base_url, ProfileId::Travel, TrimConfig::default());
        let store = Arc::new(MemoryStore::new());
        store
            .replace(
                "thread-1",
                &[
                    Message::human("q"),
                    Message::assistant_with_calls("", vec![ToolCall::new("x", "calculator", "{}")]),
                ],
            )
            .unwrap();
        let logger = Logger::buffered();
        let mut agent = build_agent(&settings, store.clone(), logger.clone());

        agent.run_turn("again").unwrap();
        server.requests();

        assert_eq!(
            store.load("thread-1").unwrap(),
            vec![
                Message::human("q"),
                Message::human("again"),
                Message::assistant("ok"),
            ]
        );
        assert_eq!(event_types(&logger)[0], "transcript.repaired");
    }
}
