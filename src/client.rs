use crate::protocol::{ApiErrorResponse, ChatCompletionResponse, CompletionResult};
use crate::tools::truncate;
use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::error::Error as StdError;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Completions are safe to retry; a couple of bounded attempts ride out transient stalls.
const MAX_RETRIES: usize = 2;

/// Blocking client for an OpenAI-compatible `/chat/completions` endpoint.
pub(crate) struct ChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry_429: bool,
}

impl ChatClient {
    pub(crate) fn new(base_url: &str, api_key: &str, retry_429: bool) -> Result<Self> {
        // Fail fast on connect, but leave slow generations room to finish.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(10 * 60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry_429,
        })
    }

    pub(crate) fn complete(&self, request: &Value) -> Result<CompletionResult> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0;
        loop {
            match self.attempt(&url, request) {
                Ok(result) => return Ok(result),
                Err(failure) if attempt < MAX_RETRIES && failure.retryable => {
                    tracing::debug!(attempt, "retrying chat completion: {:#}", failure.error);
                    sleep_backoff(attempt, failure.retry_after);
                    attempt += 1;
                }
                Err(failure) => {
                    return Err(failure.error.context(format!(
                        "chat completion failed after {} attempt(s)",
                        attempt + 1
                    )))
                }
            }
        }
    }

    fn attempt(&self, url: &str, request: &Value) -> std::result::Result<CompletionResult, Failure> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .map_err(|err| Failure::transport(err, format!("POST {url} failed")))?;

        let status = response.status();
        let headers = response.headers().clone();
        // Read bytes first so body-read timeouts can be retried too.
        let body_bytes = response.bytes().map_err(|err| {
            Failure::transport(err, format!("failed to read response body (HTTP {status})"))
        })?;
        let body = String::from_utf8_lossy(&body_bytes).to_string();

        if !status.is_success() {
            let retry_after = headers.get(RETRY_AFTER).and_then(parse_retry_after_secs);
            // 429s are only retried with an explicit Retry-After unless asked otherwise.
            let retry_allowed = status != StatusCode::TOO_MANY_REQUESTS
                || self.retry_429
                || retry_after.is_some();
            return Err(Failure {
                error: anyhow!(format_http_error(url, status.as_u16(), &headers, &body)),
                retryable: retry_allowed && should_retry_status(status),
                retry_after,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .with_context(|| {
                let (snippet, _) = truncate(&body, 2000);
                format!(
                    "unexpected chat completion response body (HTTP {}):\n{}",
                    status, snippet
                )
            })
            .map_err(Failure::fatal)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Failure::fatal(anyhow!("no choices in response")))?;
        Ok(CompletionResult {
            message: choice.message,
            usage: parsed.usage,
        })
    }
}

/// Why one request attempt failed, and whether another attempt may help.
struct Failure {
    error: anyhow::Error,
    retryable: bool,
    retry_after: Option<u64>,
}

impl Failure {
    fn fatal(error: anyhow::Error) -> Self {
        Self {
            error,
            retryable: false,
            retry_after: None,
        }
    }

    fn transport(err: reqwest::Error, context: String) -> Self {
        let retryable = should_retry_reqwest_error(&err);
        Self {
            error: anyhow!(err).context(context),
            retryable,
            retry_after: None,
        }
    }
}

pub(crate) fn is_context_error(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("context") && msg.contains("length")
}

fn format_http_error(url: &str, status: u16, headers: &HeaderMap, body: &str) -> String {
    let request_id = headers
        .get("x-request-id")
        .or_else(|| headers.get("x-openrouter-request-id"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let api_message = match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(err) => Some(err.error.message),
        // Some providers return {"error": "..."}.
        Err(_) => serde_json::from_str::<Value>(body).ok().and_then(|v| {
            v.get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
        }),
    };

    let hint = match status {
        401 | 403 => "Hint: check your API key (set `OPENROUTER_API_KEY` or use `--api-key`) and that it has access to the model.",
        404 => "Hint: check `--base-url` and the model name (`--model`).",
        408 | 504 => "Hint: the request timed out; try again or use a faster model.",
        429 => "Hint: you may be rate limited; retry later.",
        500 | 502 | 503 => "Hint: upstream/server error; retry later.",
        _ => "",
    };

    let (snippet, _) = truncate(body, 2000);
    let mut msg = format!("API error (HTTP {}) when calling {}", status, url);
    if !request_id.is_empty() {
        msg.push_str(&format!(" (request_id: {})", request_id));
    }
    if let Some(m) = api_message.filter(|m| !m.trim().is_empty()) {
        msg.push_str(&format!("\nMessage: {}", m.trim()));
    }
    if !snippet.trim().is_empty() {
        msg.push_str("\nBody:\n");
        msg.push_str(snippet.trim());
    }
    if !hint.is_empty() {
        msg.push('\n');
        msg.push_str(hint);
    }
    msg
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn should_retry_reqwest_error(err: &reqwest::Error) -> bool {
    // Truncated chunked/gzip bodies surface as decode errors; those are transient too.
    err.is_timeout()
        || err.is_connect()
        || err.is_body()
        || err.is_decode()
        || error_chain_has_retryable_io(err)
}

fn error_chain_has_retryable_io(err: &(dyn StdError + 'static)) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            if matches!(
                io.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        cur = e.source();
    }
    false
}

fn parse_retry_after_secs(v: &HeaderValue) -> Option<u64> {
    // Only the delta-seconds form; HTTP dates fall back to normal backoff.
    v.to_str().ok()?.trim().parse::<u64>().ok()
}

fn sleep_backoff(attempt: usize, retry_after_secs: Option<u64>) {
    // ~250ms, ~500ms, ~1s ... capped at 3s, plus up to 49ms of jitter.
    let base_ms = 250u64.saturating_mul(1u64 << attempt.min(10));
    let capped_ms = base_ms.min(3_000);
    let jitter_ms = (now_millis() % 50) as u64;
    let delay_ms = retry_after_secs
        .map(|s| s.saturating_mul(1000))
        .unwrap_or(capped_ms)
        .saturating_add(jitter_ms);
    thread::sleep(Duration::from_millis(delay_ms));
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
