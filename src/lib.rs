use anyhow::{bail, Result};
use clap::CommandFactory;
use clap::Parser;
use std::env;
use tracing_subscriber::EnvFilter;

mod agent;
mod attachments;
mod cli;
mod client;
mod config;
mod constants;
mod events;
mod history;
pub mod integrity;
mod logger;
pub mod message;
mod profiles;
mod prompt;
mod protocol;
mod run;
pub mod store;
#[cfg(test)]
mod testing;
mod tools;
pub mod trim;

/// Diagnostics go to stderr; stdout stays free for answers and JSONL events.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn run_cli() -> Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    if raw_args.len() == 1 || (raw_args.len() == 2 && raw_args[1] == "help") {
        let mut cmd = crate::cli::Args::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }

    let args = crate::cli::Args::parse();
    if args.json && args.stream_json {
        bail!("--json and --stream-json cannot both be set");
    }
    init_tracing();

    if args.list_profiles {
        println!("{}", crate::run::list_profiles());
        return Ok(());
    }

    let settings = crate::config::Settings::from_args(&args)?;
    if args.history {
        println!("{}", crate::run::show_history(&settings)?);
        return Ok(());
    }

    let api_key = settings.require_api_key()?;
    let answer = crate::run::run_prompt(&args, &settings, api_key)?;
    if args.stream_json || args.json {
        // stdout carries the JSONL event stream in both JSON modes.
        return Ok(());
    }
    println!("{answer}");
    Ok(())
}
