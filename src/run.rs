use crate::agent::Agent;
use crate::attachments::{compose_human_message, stage_attachment};
use crate::cli::Args;
use crate::client::ChatClient;
use crate::config::Settings;
use crate::events::ConsoleSink;
use crate::history::{format_history, render_history};
use crate::logger::Logger;
use crate::profiles::PROFILES;
use crate::prompt::load_task;
use crate::store::open_store;
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub(crate) fn run_prompt(args: &Args, settings: &Settings, api_key: &str) -> Result<String> {
    let task = load_task(args)?;

    let log_path = match (&args.log_path, &args.log_dir) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(dir)) => Some(dir.join(log_file_name(&settings.thread_id))),
        (None, None) => None,
    };
    let logger = Logger::new(log_path, args.stream_json, args.json)?;
    let logger_for_output = logger.clone();

    let staged = args
        .attachments
        .iter()
        .map(|source| stage_attachment(&settings.upload_dir, source))
        .collect::<Result<Vec<PathBuf>>>()?;
    let message = compose_human_message(&task, &staged);

    let opened = open_store(&settings.store);
    tracing::info!(store = %opened.kind, thread_id = %settings.thread_id, "starting turn");

    let client = ChatClient::new(&settings.base_url, api_key, settings.retry_429)?;
    let mut agent = Agent::new(settings, client, opened.store, logger);
    if !args.json && !args.stream_json {
        agent = agent.with_sink(Box::new(ConsoleSink::stderr()));
    }
    if let Some(limit) = settings.time_limit {
        agent.cancel_flag().cancel_after(limit);
    }

    let result = agent.run_turn(&message);
    if args.json {
        // Buffered events go out on failure too.
        let flushed = logger_for_output.emit_buffer_to_stdout();
        if result.is_ok() {
            flushed?;
        }
    }
    if !args.json && !args.stream_json {
        eprintln!("thread: {}", settings.thread_id);
    }
    result
}

/// Unique per run so logs never overwrite each other.
fn log_file_name(thread_id: &str) -> String {
    let now = OffsetDateTime::now_utc();
    let rfc3339 = now
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string());
    format!("parley-{}-{}.jsonl", rfc3339.replace(':', "-"), thread_id)
}

pub(crate) fn show_history(settings: &Settings) -> Result<String> {
    let opened = open_store(&settings.store);
    let transcript = opened
        .store
        .load(&settings.thread_id)
        .with_context(|| format!("failed to load thread {}", settings.thread_id))?;
    if transcript.is_empty() {
        return Ok(format!("no stored history for thread {}", settings.thread_id));
    }
    Ok(format_history(&render_history(&transcript)))
}

pub(crate) fn list_profiles() -> String {
    PROFILES
        .iter()
        .map(|profile| {
            let id = profile
                .id
                .to_possible_value()
                .map(|v| v.get_name().to_string())
                .unwrap_or_default();
            let tools: Vec<&str> = profile.tools.iter().map(|tool| tool.name()).collect();
            if tools.is_empty() {
                format!("{:<18}{}", id, profile.name)
            } else {
                format!("{:<18}{} (tools: {})", id, profile.name, tools.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
