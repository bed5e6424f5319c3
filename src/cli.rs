use crate::profiles::ProfileId;
use crate::store::DEFAULT_STORE_TTL;
use crate::trim::{SizeMetricKind, DEFAULT_MAX_MODEL_MESSAGES, DEFAULT_MAX_STORED_MESSAGES};
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(group(
    ArgGroup::new("task_input")
        .required(false)
        .args(["prompt_file", "prompt"])
))]
#[command(
    name = "parley",
    version,
    about = "Parley is a multi-profile ReAct chat agent with persistent, bounded conversation threads.",
    long_about = "Parley is a multi-profile ReAct chat agent for OpenRouter-compatible models. \
Each thread's history is persisted, trimmed before every model call and after every turn, \
and kept free of dangling tool calls."
)]
pub(crate) struct Args {
    #[arg(
        long,
        default_value = "google/gemini-2.5-flash",
        env = "PARLEY_MODEL",
        help = "Model ID to use (OpenRouter format)."
    )]
    pub(crate) model: String,

    #[arg(long, value_name = "FILE", help = "Read the prompt from a file.")]
    pub(crate) prompt_file: Option<PathBuf>,

    #[arg(long, help = "OpenRouter API key (overrides OPENROUTER_API_KEY).")]
    pub(crate) api_key: Option<String>,

    #[arg(
        long,
        default_value = "https://openrouter.ai/api/v1",
        env = "PARLEY_BASE_URL",
        help = "Chat completions API base URL."
    )]
    pub(crate) base_url: String,

    #[arg(
        long,
        default_value_t = 0.2,
        env = "PARLEY_TEMPERATURE",
        help = "Sampling temperature."
    )]
    pub(crate) temperature: f64,

    #[arg(
        long,
        value_enum,
        default_value_t = ProfileId::Tutor,
        env = "PARLEY_PROFILE",
        help = "Agent profile (system prompt and tools)."
    )]
    pub(crate) profile: ProfileId,

    #[arg(
        long,
        help = "Conversation thread to continue (a new thread id is generated when omitted)."
    )]
    pub(crate) thread_id: Option<String>,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_MODEL_MESSAGES,
        env = "PARLEY_MAX_MODEL_MESSAGES",
        help = "Budget for the history sent to the model on each call."
    )]
    pub(crate) max_model_messages: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_STORED_MESSAGES,
        env = "PARLEY_MAX_STORED_MESSAGES",
        help = "Budget for the history kept in the store between turns."
    )]
    pub(crate) max_stored_messages: usize,

    #[arg(
        long,
        value_enum,
        default_value_t = SizeMetricKind::Messages,
        help = "How budgets are measured: message count or approximate tokens."
    )]
    pub(crate) size_metric: SizeMetricKind,

    #[arg(
        long,
        value_name = "FILE",
        env = "PARLEY_STORE_PATH",
        help = "SQLite file for conversation threads (defaults to the platform data directory)."
    )]
    pub(crate) store_path: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = DEFAULT_STORE_TTL.as_secs(),
        env = "PARLEY_STORE_TTL_SEC",
        help = "Seconds of inactivity after which a stored thread expires (0 disables expiry)."
    )]
    pub(crate) store_ttl_sec: u64,

    #[arg(
        long,
        default_value_t = false,
        help = "Keep threads in memory only (nothing survives the process)."
    )]
    pub(crate) memory_store: bool,

    #[arg(long, help = "Maximum number of model calls in one turn.")]
    pub(crate) max_steps: Option<usize>,

    #[arg(
        long,
        help = "Cancel the turn after this many seconds (checked between model and tool calls)."
    )]
    pub(crate) time_limit_sec: Option<u64>,

    #[arg(long, help = "Maximum tool output characters to retain.")]
    pub(crate) max_tool_output_chars: Option<usize>,

    #[arg(
        long = "attach",
        value_name = "FILE",
        help = "Attach a file to the message (repeatable)."
    )]
    pub(crate) attachments: Vec<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Directory attachments are copied into (default: ./uploads)."
    )]
    pub(crate) upload_dir: Option<PathBuf>,

    #[arg(long, help = "Directory to write the JSONL log file.")]
    pub(crate) log_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Path to write the JSONL log file (overrides --log-dir)."
    )]
    pub(crate) log_path: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = false,
        help = "Print the JSONL event stream to stdout after completion (suppresses plain final answer output)."
    )]
    pub(crate) json: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Stream the JSONL event stream to stdout as events occur (suppresses plain final answer output)."
    )]
    pub(crate) stream_json: bool,

    #[arg(
        long,
        env = "PARLEY_RETRY_429",
        default_value_t = false,
        help = "Retry HTTP 429 responses (rate limited). By default, 429s are only retried when Retry-After is present."
    )]
    pub(crate) retry_429: bool,

    #[arg(
        long,
        default_value_t = false,
        requires = "thread_id",
        help = "Print the stored history of --thread-id and exit."
    )]
    pub(crate) history: bool,

    #[arg(long, default_value_t = false, help = "List the available profiles and exit.")]
    pub(crate) list_profiles: bool,

    #[arg(value_name = "PROMPT", help = "Prompt text (quote for spaces).")]
    pub(crate) prompt: Option<String>,
}
