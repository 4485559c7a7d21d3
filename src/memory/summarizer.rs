//! Summarizer: turns a rendered session prompt into a bounded summary.

use crate::generator::{GeneratorError, TextGenerator};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error};

/// Why a compression cycle did not complete.
///
/// Every variant means the same thing for the session buffer: nothing was
/// reset, and the next qualifying assistant turn tries again.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SummarizerError {
    #[error("summarizer has no text generator configured")]
    Unconfigured,

    #[error("summary generation failed: {0}")]
    GenerationFailure(String),

    #[error("no embedding provider configured or available for a new memory collection")]
    NoEmbeddingCapability,

    #[error("failed to store summary: {0}")]
    StoreWriteFailure(String),
}

impl From<GeneratorError> for SummarizerError {
    fn from(e: GeneratorError) -> Self {
        Self::GenerationFailure(e.to_string())
    }
}

/// Delegates summarization to an injected [`TextGenerator`]
#[derive(Clone, Default)]
pub struct Summarizer {
    generator: Option<Arc<dyn TextGenerator>>,
    timeout: Option<Duration>,
}

impl Summarizer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator: Some(generator),
            timeout: None,
        }
    }

    /// A summarizer with no backend; every call fails with `Unconfigured`
    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.generator.is_some()
    }

    /// Generate a summary for `prompt`. No retries here: the caller keeps
    /// the buffer and tries again on a later turn.
    pub async fn summarize(&self, prompt: &str) -> Result<String, SummarizerError> {
        let Some(generator) = &self.generator else {
            error!("Compression requested but no text generator is configured; memories are not being saved");
            return Err(SummarizerError::Unconfigured);
        };

        let raw = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, generator.generate(prompt))
                .await
                .map_err(|_| {
                    SummarizerError::GenerationFailure(format!("timed out after {:?}", limit))
                })??,
            None => generator.generate(prompt).await?,
        };

        let summary = strip_reasoning(&raw);
        if summary.is_empty() {
            return Err(SummarizerError::GenerationFailure(
                "generator returned an empty summary".to_string(),
            ));
        }
        debug!("Summary generated ({} chars)", summary.len());
        Ok(summary)
    }
}

fn think_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").unwrap())
}

/// Remove `<think>` blocks some models emit before the answer
fn strip_reasoning(text: &str) -> String {
    let without = think_pattern().replace_all(text, "");
    // An unterminated block means the model never got to the answer
    match without.find("<think>") {
        Some(start) => without[..start].trim().to_string(),
        None => without.trim().to_string(),
    }
}
