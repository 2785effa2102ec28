use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use ensemble_core::LlmConfig;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Text-in, text-out completion backend for one agent turn.
///
/// `stream` invokes `on_delta` for each raw fragment as it arrives and returns
/// the fully assembled response once the stream ends. Reasoning deltas are
/// delivered wrapped between [`THINK_OPEN`] and [`THINK_CLOSE`] markers so the
/// same downstream splitter handles both server-side reasoning and inline
/// thought tags. Setting `cancel` aborts the read between fragments.
pub trait AgentBackend: Send + Sync {
    fn generate(&self, system: &str, prompt: &str) -> Result<String>;

    fn stream(
        &self,
        system: &str,
        prompt: &str,
        cancel: &AtomicBool,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    cfg: LlmConfig,
    client: Client,
}

impl HttpBackend {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{} is not set", self.cfg.api_key_env))
    }

    fn build_payload(&self, system: &str, prompt: &str, stream: bool) -> Value {
        json!({
            "model": self.cfg.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_output_tokens,
            "stream": stream
        })
    }

    fn generate_inner(&self, payload: &Value, api_key: &str) -> Result<String> {
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_completion_payload(&body);
                    }
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("completion request failed without detailed error")))
    }

    fn stream_inner(
        &self,
        payload: &Value,
        api_key: &str,
        cancel: &AtomicBool,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));

                    if status.is_success() {
                        let mut assembled = String::new();
                        let mut in_reasoning = false;

                        let reader = std::io::BufReader::new(resp);
                        for line_result in reader.lines() {
                            if cancel.load(Ordering::Relaxed) {
                                break;
                            }
                            let line = match line_result {
                                Ok(l) => l,
                                Err(e) => {
                                    last_err = Some(anyhow!("stream read error: {e}"));
                                    break;
                                }
                            };
                            let trimmed = line.trim();
                            if !trimmed.starts_with("data:") {
                                continue;
                            }
                            let chunk = trimmed.trim_start_matches("data:").trim();
                            if chunk == "[DONE]" {
                                break;
                            }
                            let value: Value = match serde_json::from_str(chunk) {
                                Ok(v) => v,
                                Err(_) => continue,
                            };
                            let delta = value
                                .get("choices")
                                .and_then(|v| v.as_array())
                                .and_then(|arr| arr.first())
                                .and_then(|choice| choice.get("delta"));
                            let Some(delta) = delta else {
                                continue;
                            };
                            if let Some(reasoning) =
                                delta.get("reasoning_content").and_then(|v| v.as_str())
                                && !reasoning.is_empty()
                            {
                                if !in_reasoning {
                                    in_reasoning = true;
                                    assembled.push_str(THINK_OPEN);
                                    on_delta(THINK_OPEN);
                                }
                                assembled.push_str(reasoning);
                                on_delta(reasoning);
                            }
                            if let Some(content) = delta.get("content").and_then(|v| v.as_str())
                                && !content.is_empty()
                            {
                                if in_reasoning {
                                    in_reasoning = false;
                                    assembled.push_str(THINK_CLOSE);
                                    on_delta(THINK_CLOSE);
                                }
                                assembled.push_str(content);
                                on_delta(content);
                            }
                        }

                        if let Some(err) = last_err.take() {
                            return Err(err);
                        }
                        // Stream ended (or was cancelled) inside reasoning.
                        if in_reasoning {
                            assembled.push_str(THINK_CLOSE);
                            on_delta(THINK_CLOSE);
                        }
                        return Ok(assembled);
                    }

                    let body = resp.text().unwrap_or_default();
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("streaming request failed without detailed error")))
    }
}

impl AgentBackend for HttpBackend {
    fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let key = self.resolve_api_key()?;
        let payload = self.build_payload(system, prompt, false);
        self.generate_inner(&payload, &key)
    }

    fn stream(
        &self,
        system: &str,
        prompt: &str,
        cancel: &AtomicBool,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let key = self.resolve_api_key()?;
        let payload = self.build_payload(system, prompt, true);
        self.stream_inner(&payload, &key, cancel, on_delta)
    }
}

/// Parse a non-streaming chat completion body. Server-side reasoning, when
/// present, is folded in ahead of the content wrapped in thought markers.
fn parse_completion_payload(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)?;
    let message = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("unexpected completion payload: missing choices[0].message"))?;
    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let reasoning = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if content.is_empty() && reasoning.is_empty() {
        return Err(anyhow!(
            "unexpected completion payload: missing message.content"
        ));
    }
    if reasoning.is_empty() {
        Ok(content.to_string())
    } else {
        Ok(format!("{THINK_OPEN}{reasoning}{THINK_CLOSE}{content}"))
    }
}

/// Produce a user-friendly error from an API HTTP response.
fn format_api_error(status: StatusCode, body: &str, attempt: u8, max_retries: u8) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => anyhow!(
            "Invalid or missing API key (HTTP 401).\n\
             Set the configured llm.api_key_env environment variable."
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Try again shortly. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        StatusCode::PAYMENT_REQUIRED => {
            anyhow!("Insufficient balance (HTTP 402). Top up your provider account.")
        }
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
            "Model server error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
            status.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => anyhow!("Model API error (HTTP {}): {}", status.as_u16(), detail),
    }
}

/// Produce a user-friendly error from a transport/network failure.
fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    if err.is_timeout() {
        anyhow!(
            "Request timed out. The model API did not respond in time.\n\
             If this persists, try increasing llm.timeout_seconds in your config."
        )
    } else if is_dns {
        anyhow!(
            "DNS resolution failed. Could not resolve the model API hostname.\n\
             Check your internet connection and DNS settings."
        )
    } else if err.is_connect() {
        anyhow!(
            "Connection refused. Could not reach the model API at the configured endpoint.\n\
             Check your network connection and firewall settings."
        )
    } else {
        anyhow!("Network error: {err}. Retrying with exponential backoff if retries remain.")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let now = Utc::now();
    let delta = retry_at.signed_duration_since(now).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}
