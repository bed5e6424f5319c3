use crate::cli::Args;
use crate::constants::{DEFAULT_MAX_TOOL_OUTPUT_CHARS, DEFAULT_UPLOAD_DIR};
use crate::profiles::Profile;
use crate::store::StoreConfig;
use crate::trim::TrimConfig;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Everything a run needs, resolved once from arguments and environment.
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) model: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) temperature: f64,
    pub(crate) profile: &'static Profile,
    pub(crate) thread_id: String,
    pub(crate) trim: TrimConfig,
    pub(crate) store: StoreConfig,
    pub(crate) max_steps: Option<usize>,
    pub(crate) time_limit: Option<Duration>,
    pub(crate) max_tool_output_chars: usize,
    pub(crate) retry_429: bool,
    pub(crate) upload_dir: PathBuf,
}

impl Settings {
    pub(crate) fn from_args(args: &Args) -> Result<Self> {
        let trim = TrimConfig {
            max_model_messages: args.max_model_messages,
            max_stored_messages: args.max_stored_messages,
            metric: args.size_metric,
        };
        trim.validate().context("invalid history budgets")?;

        let store = StoreConfig {
            path: if args.memory_store {
                None
            } else {
                Some(args.store_path.clone().unwrap_or_else(default_store_path))
            },
            ttl: (args.store_ttl_sec > 0).then(|| Duration::from_secs(args.store_ttl_sec)),
        };

        if args.max_steps == Some(0) {
            bail!("--max-steps must be at least 1");
        }

        let api_key = args
            .api_key
            .clone()
            .or_else(|| env::var("OPENROUTER_API_KEY").ok())
            .filter(|key| !key.is_empty());

        Ok(Self {
            model: args.model.clone(),
            base_url: args.base_url.clone(),
            api_key,
            temperature: args.temperature,
            profile: args.profile.profile(),
            thread_id: args
                .thread_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            trim,
            store,
            max_steps: args.max_steps,
            time_limit: args.time_limit_sec.map(Duration::from_secs),
            max_tool_output_chars: args
                .max_tool_output_chars
                .unwrap_or(DEFAULT_MAX_TOOL_OUTPUT_CHARS),
            retry_429: args.retry_429,
            upload_dir: args
                .upload_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
        })
    }

    pub(crate) fn require_api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(key) => Ok(key),
            None => bail!("missing API key: set --api-key or OPENROUTER_API_KEY"),
        }
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("parley"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("threads.db")
}
