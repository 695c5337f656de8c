use crate::error::FloorsumError;
use crate::sched::cancel::CancelToken;
use crate::sched::config::{ProviderKind, SummarizerConfig, api_key_from_env};
use crate::sched::floor::Batch;
use crate::sched::util::{normalize_whitespace, truncate_with_ellipsis};
use crate::sched::warn;
use reqwest::blocking::Client;
use serde_json::Value;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(50);
const MIN_SUMMARY_CHARS: usize = 10;
const SHORT_SUMMARY_CHARS: usize = 200;
const LOCAL_MAX_LINES: usize = 12;
const LOCAL_LINE_CHARS: usize = 160;
const FAILURE_VOCABULARY: &[&str] = &[
    "error",
    "failed",
    "sorry",
    "unable",
    "cannot",
    "rate limit",
    "quota",
    "timeout",
    "unauthorized",
    "invalid api key",
    "错误",
    "失败",
    "抱歉",
    "无法",
    "超时",
];

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub conversation: String,
    pub batch: Batch,
    pub text: String,
}

pub trait Summarizer: Send + Sync {
    fn name(&self) -> &'static str;
    /// Must return `FloorsumError::Cancelled` promptly once `cancel` fires.
    fn summarize(&self, request: &BatchRequest, cancel: &CancelToken)
    -> Result<String, FloorsumError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &SummarizerConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

fn looks_like_failure(lowered: &str) -> bool {
    FAILURE_VOCABULARY.iter().any(|word| lowered.contains(word))
}

/// Accepts a summarizer response or rejects it as an error-shaped reply.
pub fn validate_summary(raw: &str) -> Result<String, FloorsumError> {
    let trimmed = raw.trim();
    let chars = trimmed.chars().count();
    if chars < MIN_SUMMARY_CHARS {
        return Err(FloorsumError::RejectedResponse(format!(
            "empty or near-empty response ({chars} chars)"
        )));
    }
    if chars < SHORT_SUMMARY_CHARS && looks_like_failure(&trimmed.to_lowercase()) {
        return Err(FloorsumError::RejectedResponse(format!(
            "short response looks like an error: {}",
            truncate_with_ellipsis(trimmed, 80)
        )));
    }
    Ok(trimmed.to_string())
}

/// Calls the summarizer with retries, validating every response.
pub fn invoke_with_policy(
    summarizer: &dyn Summarizer,
    request: &BatchRequest,
    cancel: &CancelToken,
    policy: RetryPolicy,
) -> Result<String, FloorsumError> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(FloorsumError::Cancelled);
        }
        let outcome = summarizer
            .summarize(request, cancel)
            .and_then(|raw| validate_summary(&raw));
        let err = match outcome {
            Ok(text) => return Ok(text),
            Err(FloorsumError::Cancelled) => return Err(FloorsumError::Cancelled),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        let retry = format!("{attempt}/{}", policy.max_retries);
        let detail = err.to_string();
        warn::emit(warn::WarnEvent {
            code: "SUMMARIZE_RETRY",
            stage: "invoke",
            action: summarizer.name(),
            conversation: &request.conversation,
            range: Some(request.batch),
            retry: &retry,
            reason: "attempt-failed",
            err: &detail,
        });
        if !cancel.sleep(policy.backoff) {
            return Err(FloorsumError::Cancelled);
        }
    }
}

pub fn build_prompt(request: &BatchRequest) -> String {
    format!(
        "Summarize conversation floors {} ({} messages). Keep names, decisions, facts, and open threads. Reply with the summary only.\n\n{}",
        request.batch.display_range(),
        request.batch.len(),
        request.text
    )
}

/// Deterministic extractive summary used when no model is configured.
#[derive(Debug, Default)]
pub struct LocalSummarizer;

impl Summarizer for LocalSummarizer {
    fn name(&self) -> &'static str {
        "local"
    }

    fn summarize(
        &self,
        request: &BatchRequest,
        cancel: &CancelToken,
    ) -> Result<String, FloorsumError> {
        if cancel.is_cancelled() {
            return Err(FloorsumError::Cancelled);
        }
        let lines: Vec<&str> = request
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let mut summary = format!(
            "Floors {} recap ({} messages)\n",
            request.batch.display_range(),
            request.batch.len()
        );
        for line in lines.iter().take(LOCAL_MAX_LINES) {
            summary.push_str("- ");
            summary.push_str(&truncate_with_ellipsis(
                &normalize_whitespace(line),
                LOCAL_LINE_CHARS,
            ));
            summary.push('\n');
        }
        if lines.len() > LOCAL_MAX_LINES {
            summary.push_str(&format!(
                "- ... {} more messages\n",
                lines.len() - LOCAL_MAX_LINES
            ));
        }
        Ok(summary)
    }
}

/// Stand-in for commands that never summarize; any call is a config error.
#[derive(Debug, Default)]
pub struct DisabledSummarizer;

impl Summarizer for DisabledSummarizer {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn summarize(
        &self,
        _request: &BatchRequest,
        _cancel: &CancelToken,
    ) -> Result<String, FloorsumError> {
        Err(FloorsumError::InvalidConfig(
            "no summarizer available for this command".to_string(),
        ))
    }
}

/// Pipes batch text through a shell command and takes stdout as the summary.
#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    pub command: String,
    pub timeout: Duration,
}

impl Summarizer for CommandSummarizer {
    fn name(&self) -> &'static str {
        "command"
    }

    fn summarize(
        &self,
        request: &BatchRequest,
        cancel: &CancelToken,
    ) -> Result<String, FloorsumError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("FLOORSUM_BATCH_START", request.batch.start.to_string())
            .env("FLOORSUM_BATCH_END", request.batch.end.to_string())
            .env("FLOORSUM_CONVERSATION", &request.conversation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                FloorsumError::InvokeFailed(format!("failed to spawn `{}`: {err}", self.command))
            })?;

        let stdin = child.stdin.take();
        let input = request.text.clone();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin closes the pipe early; not an error.
                let _ = stdin.write_all(input.as_bytes());
            }
        });
        let stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut out = String::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_string(&mut out);
            }
            out
        });
        let stderr = child.stderr.take();
        let err_reader = thread::spawn(move || {
            let mut out = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut out);
            }
            out
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(FloorsumError::InvokeFailed(format!(
                        "failed to poll summarizer command: {err}"
                    )));
                }
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FloorsumError::Cancelled);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FloorsumError::Timeout(self.timeout.as_secs()));
            }
            thread::sleep(POLL_SLICE);
        };

        let _ = writer.join();
        let stdout = reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(FloorsumError::InvokeFailed(format!(
                "summarizer command exited with {status}: {}",
                truncate_with_ellipsis(stderr.trim(), 200)
            )));
        }
        Ok(stdout)
    }
}

type HttpCall = Box<dyn FnOnce() -> Result<String, FloorsumError> + Send>;

/// Runs a blocking HTTP call on a helper thread so cancellation is observed
/// while the request is still in flight.
fn run_abortable(
    call: HttpCall,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<String, FloorsumError> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(call());
    });
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(FloorsumError::Cancelled);
        }
        match rx.recv_timeout(POLL_SLICE) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() >= deadline {
                    return Err(FloorsumError::Timeout(timeout.as_secs()));
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(FloorsumError::InvokeFailed(
                    "summarizer request thread exited without a result".to_string(),
                ));
            }
        }
    }
}

fn http_client(timeout: Duration) -> Result<Client, FloorsumError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| FloorsumError::InvokeFailed(format!("failed to build http client: {err}")))
}

fn invoke_err(provider: &str, err: reqwest::Error) -> FloorsumError {
    if err.is_timeout() {
        FloorsumError::InvokeFailed(format!("{provider} request timed out: {err}"))
    } else {
        FloorsumError::InvokeFailed(format!("{provider} request failed: {err}"))
    }
}

fn extract_openai_compatible_text(json: &Value) -> Option<String> {
    let choices = json.get("choices").and_then(Value::as_array)?;
    let content = choices.first()?.get("message")?.get("content")?;
    match content {
        Value::String(s) => Some(s.to_string()),
        Value::Array(parts) => {
            let chunks: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if chunks.is_empty() {
                None
            } else {
                Some(chunks.join("\n"))
            }
        }
        _ => None,
    }
}

fn extract_anthropic_text(json: &Value) -> Option<String> {
    let content = json.get("content").and_then(Value::as_array)?;
    let chunks: Vec<&str> = content
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatSummarizer {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Summarizer for OpenAiCompatSummarizer {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn summarize(
        &self,
        request: &BatchRequest,
        cancel: &CancelToken,
    ) -> Result<String, FloorsumError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": build_prompt(request)}
            ],
            "temperature": 0.2
        });
        let api_key = self.api_key.clone();
        let timeout = self.timeout;
        let call: HttpCall = Box::new(move || {
            let client = http_client(timeout)?;
            let response = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&payload)
                .send()
                .map_err(|err| invoke_err("openai-compatible", err))?;
            if !response.status().is_success() {
                return Err(FloorsumError::InvokeFailed(format!(
                    "openai-compatible call failed with status {}",
                    response.status()
                )));
            }
            let json: Value = response
                .json()
                .map_err(|err| invoke_err("openai-compatible", err))?;
            extract_openai_compatible_text(&json).ok_or_else(|| {
                FloorsumError::RejectedResponse(
                    "openai-compatible response missing text content".to_string(),
                )
            })
        });
        run_abortable(call, cancel, self.timeout)
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicSummarizer {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Summarizer for AnthropicSummarizer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn summarize(
        &self,
        request: &BatchRequest,
        cancel: &CancelToken,
    ) -> Result<String, FloorsumError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": 1200,
            "temperature": 0.2,
            "messages": [
                {"role": "user", "content": build_prompt(request)}
            ]
        });
        let api_key = self.api_key.clone();
        let timeout = self.timeout;
        let call: HttpCall = Box::new(move || {
            let client = http_client(timeout)?;
            let response = client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&payload)
                .send()
                .map_err(|err| invoke_err("anthropic", err))?;
            if !response.status().is_success() {
                return Err(FloorsumError::InvokeFailed(format!(
                    "anthropic call failed with status {}",
                    response.status()
                )));
            }
            let json: Value = response
                .json()
                .map_err(|err| invoke_err("anthropic", err))?;
            extract_anthropic_text(&json).ok_or_else(|| {
                FloorsumError::RejectedResponse(
                    "anthropic response missing text content".to_string(),
                )
            })
        });
        run_abortable(call, cancel, self.timeout)
    }
}

pub fn build_summarizer(cfg: &SummarizerConfig) -> Result<Arc<dyn Summarizer>, FloorsumError> {
    let timeout = Duration::from_secs(cfg.timeout_secs);
    let kind = cfg.provider_kind().ok_or_else(|| {
        FloorsumError::InvalidConfig(format!("unknown summarizer provider `{}`", cfg.provider))
    })?;
    let summarizer: Arc<dyn Summarizer> = match kind {
        ProviderKind::Local => Arc::new(LocalSummarizer),
        ProviderKind::Command => Arc::new(CommandSummarizer {
            command: cfg.command.clone(),
            timeout,
        }),
        ProviderKind::OpenAiCompatible | ProviderKind::Anthropic => {
            let api_key = api_key_from_env(kind).ok_or_else(|| {
                FloorsumError::InvalidConfig(format!(
                    "provider {} needs FLOORSUM_API_KEY (or a vendor key) in the environment",
                    cfg.provider
                ))
            })?;
            if kind == ProviderKind::Anthropic {
                let base_url = if cfg.base_url.trim().is_empty() {
                    "https://api.anthropic.com".to_string()
                } else {
                    cfg.base_url.trim().to_string()
                };
                Arc::new(AnthropicSummarizer {
                    base_url,
                    model: cfg.model.clone(),
                    api_key,
                    timeout,
                })
            } else {
                let base_url = if cfg.base_url.trim().is_empty() {
                    "https://api.openai.com".to_string()
                } else {
                    cfg.base_url.trim().to_string()
                };
                Arc::new(OpenAiCompatSummarizer {
                    base_url,
                    model: cfg.model.clone(),
                    api_key,
                    timeout,
                })
            }
        }
    };
    Ok(summarizer)
}
