//! Shared plumbing for the OpenAI-protocol provider adapters.
//!
//! All three reference adapters speak an OpenAI-compatible chat completions
//! surface, so the request construction, response parsing, streaming decode,
//! and error translation live here. Each adapter contributes only its model
//! table, base URL, and health probe.

use crate::tradecouncil::adapter::{
    approx_usage, ProviderAdapter, TaskOptions, TaskResult, TokenUsage,
};
use crate::tradecouncil::catalog::ModelSpec;
use crate::tradecouncil::error::{ErrorKind, TaskError};
use futures_util::StreamExt;
use lazy_static::lazy_static;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm, which matters
    /// when many concurrent tasks hit the same provider hosts.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Text plus whatever usage the provider reported.
pub struct ChatOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Build an OpenAI-style chat completions body for one prompt.
pub fn build_chat_body(
    model: &str,
    prompt: &str,
    options: &TaskOptions,
    stream: bool,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "temperature": options.temperature.unwrap_or(0.7),
    });
    if let Some(top_p) = options.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if stream {
        body["stream"] = serde_json::json!(true);
        // Ask for a trailing usage chunk where the gateway supports it.
        body["stream_options"] = serde_json::json!({"include_usage": true});
    }
    body
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> TaskError {
    let kind = match status.as_u16() {
        401 | 403 => ErrorKind::ApiKeyInvalid,
        429 => ErrorKind::RateLimited,
        _ => ErrorKind::HttpError,
    };
    let detail: String = body.chars().take(200).collect();
    TaskError::new(kind, format!("HTTP {}: {}", status.as_u16(), detail))
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> TaskError {
    if err.is_timeout() {
        TaskError::new(
            ErrorKind::Timeout,
            format!("request timed out after {}s", timeout.as_secs()),
        )
    } else {
        TaskError::new(ErrorKind::HttpError, err.to_string())
    }
}

fn parse_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some(TokenUsage::new(prompt, completion))
}

/// Issue a non-streaming chat completion and surface the assistant text.
pub async fn chat_completion(
    base_url: &str,
    api_key: &str,
    body: serde_json::Value,
    timeout: Duration,
) -> Result<ChatOutcome, TaskError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let resp = shared_http_client()
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| classify_transport(e, timeout))?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| classify_transport(e, timeout))?;
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }

    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| TaskError::new(ErrorKind::HttpError, format!("malformed response: {}", e)))?;
    let content = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    if content.trim().is_empty() {
        return Err(TaskError::new(
            ErrorKind::EmptyResponse,
            "provider returned empty text",
        ));
    }
    Ok(ChatOutcome {
        text: content,
        usage: parse_usage(&parsed),
    })
}

/// Issue a streaming chat completion, forwarding fragments to `sink`.
///
/// The SSE byte stream is decoded with a lossy UTF-8 decoder so invalid bytes
/// never abort the call; malformed event lines are skipped silently. A
/// panicking sink is isolated per fragment.
pub async fn chat_completion_stream(
    base_url: &str,
    api_key: &str,
    body: serde_json::Value,
    timeout: Duration,
    sink: Option<&crate::tradecouncil::adapter::TokenSink>,
) -> Result<ChatOutcome, TaskError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let resp = shared_http_client()
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| classify_transport(e, timeout))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, &text));
    }

    let deadline = Instant::now() + timeout;
    let mut stream = resp.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    let mut text = String::new();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TaskError::new(
                ErrorKind::Timeout,
                format!("stream timed out after {}s", timeout.as_secs()),
            ));
        }
        let chunk = match tokio::time::timeout(remaining, stream.next()).await {
            Err(_) => {
                return Err(TaskError::new(
                    ErrorKind::Timeout,
                    format!("stream timed out after {}s", timeout.as_secs()),
                ))
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(classify_transport(e, timeout)),
            Ok(Some(Ok(bytes))) => bytes,
        };
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                pending.clear();
                break;
            }
            // Malformed fragments are dropped without aborting the stream.
            let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            if let Some(u) = parse_usage(&event) {
                usage = Some(u);
            }
            let fragment = event
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or("");
            if fragment.is_empty() {
                continue;
            }
            text.push_str(fragment);
            if let Some(sink) = sink {
                let _ = catch_unwind(AssertUnwindSafe(|| sink(fragment)));
            }
        }
    }

    if text.trim().is_empty() {
        return Err(TaskError::new(
            ErrorKind::EmptyResponse,
            "provider stream carried no text",
        ));
    }
    Ok(ChatOutcome { text, usage })
}

/// Execute one task against an OpenAI-compatible endpoint on behalf of an
/// adapter. Handles key validation, timeout selection, the streaming vs.
/// non-streaming split, usage estimation, and cost computation.
pub async fn execute_openai_compat(
    adapter: &dyn ProviderAdapter,
    base_url: &str,
    api_key: &str,
    spec: &ModelSpec,
    prompt: &str,
    options: &TaskOptions,
) -> TaskResult {
    if api_key.is_empty() {
        return TaskResult::failed(
            ErrorKind::ApiKeyMissing,
            format!("no API key configured for {}", spec.provider),
        );
    }

    let timeout = options.timeout.unwrap_or_else(|| adapter.default_timeout(spec));
    let streaming = options.stream && spec.supports_streaming;
    let body = build_chat_body(&spec.name, prompt, options, streaming);

    let start = Instant::now();
    let outcome = if streaming {
        chat_completion_stream(base_url, api_key, body, timeout, options.on_token.as_ref()).await
    } else {
        chat_completion(base_url, api_key, body, timeout).await
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(outcome) => {
            let usage = outcome
                .usage
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| approx_usage(prompt, &outcome.text));
            let cost = usage.total_tokens as f64 / 1000.0 * spec.cost_per_1k_tokens;
            TaskResult::completed(outcome.text, spec.clone(), elapsed_ms, cost, usage)
        }
        Err(err) => {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!(
                    "{} call to {} failed: {}",
                    spec.provider,
                    spec.name,
                    err
                );
            }
            TaskResult::failed_after(err.kind, err.message, elapsed_ms)
        }
    }
}

/// Shared health probe: a cheap authenticated GET that must answer 2xx
/// within ten seconds.
pub async fn probe_endpoint(url: &str, api_key: &str) -> bool {
    if api_key.is_empty() {
        return false;
    }
    match shared_http_client()
        .get(url)
        .header("Authorization", format!("Bearer {}", api_key))
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
