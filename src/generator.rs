//! Text generation backends.
//!
//! The summarizer only needs "prompt in, text out". [`HttpTextGenerator`]
//! talks to any OpenAI-compatible Chat Completions endpoint.

use crate::config::GeneratorConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry config: max attempts including the first one
const MAX_RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Errors from a text generation backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum GeneratorError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("network: {0}")]
    Network(String),

    #[error("API error {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("missing credentials: {0}")]
    Credentials(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl GeneratorError {
    /// Timeouts, connection failures and 5xx responses are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Something that turns a prompt into generated text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError>;
}

// ─── Chat Completions API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

// ─── HTTP generator ─────────────────────────────────────────────────

/// Chat Completions client with retry and exponential backoff
pub struct HttpTextGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl HttpTextGenerator {
    /// Build a generator from config. The API key is read from the
    /// configured environment variable now, once.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("memorychain/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GeneratorError::Network(e.to_string()))?;

        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    return Err(GeneratorError::Credentials(format!(
                        "environment variable {} is not set",
                        var
                    )))
                }
            },
            None => None,
        };

        info!(
            "Text generator: model={}, base_url={}, auth={}",
            config.model,
            config.base_url,
            api_key.is_some()
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Exponential backoff with a small deterministic jitter
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    async fn send_request(&self, prompt: &str) -> Result<String, GeneratorError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Api {
                status: status.as_u16(),
                detail: truncate_error_detail(&extract_error_detail(&body), 500),
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Malformed(e.to_string()))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GeneratorError::Malformed("no choices in response".to_string()))
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        debug!("Calling LLM with prompt length: {}", prompt.len());

        let mut attempt = 0;
        loop {
            match self.send_request(prompt).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = Self::retry_backoff(attempt);
                    warn!(
                        "LLM request failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt, MAX_RETRY_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> GeneratorError {
    if e.is_timeout() {
        GeneratorError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        GeneratorError::Network(e.to_string())
    } else {
        GeneratorError::Malformed(e.to_string())
    }
}

/// Pull a human-readable message out of an error body
fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}

fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }

    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GeneratorError::Timeout("t".into()).is_retryable());
        assert!(GeneratorError::Api { status: 503, detail: String::new() }.is_retryable());
        assert!(!GeneratorError::Api { status: 401, detail: String::new() }.is_retryable());
        assert!(!GeneratorError::Malformed("m".into()).is_retryable());
    }

    #[test]
    fn test_backoff_grows() {
        let first = HttpTextGenerator::retry_backoff(1);
        let third = HttpTextGenerator::retry_backoff(3);
        assert!(third > first * 3);
    }

    #[test]
    fn test_extract_error_detail() {
        assert_eq!(
            extract_error_detail(r#"{"error":{"message":"rate limited"}}"#),
            "rate limited"
        );
        assert_eq!(extract_error_detail(r#"{"message":"bad"}"#), "bad");
        assert_eq!(extract_error_detail("  plain text "), "plain text");
        assert_eq!(extract_error_detail(""), "");
    }

    #[test]
    fn test_truncate_error_detail() {
        let long = "x".repeat(20);
        assert_eq!(truncate_error_detail(&long, 5), "xxxxx... [truncated]");
        assert_eq!(truncate_error_detail("short", 10), "short");
    }

    #[test]
    fn test_missing_api_key_is_reported() {
        let config = GeneratorConfig {
            api_key_env: Some("MEMORYCHAIN_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            ..GeneratorConfig::default()
        };
        assert!(matches!(
            HttpTextGenerator::from_config(&config),
            Err(GeneratorError::Credentials(_))
        ));
    }
}
