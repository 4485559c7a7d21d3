//! Configuration for Memorychain
//!
//! Loaded from `config.toml`. Every field has a default, so a missing file
//! or a partial file is fine:
//!
//! ```toml
//! enabled = true
//! max_history = 60
//! compress_threshold = 50
//! bot_name = "assistant"
//!
//! [generator]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//! ```

use crate::{MemoryChainError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_MAX_HISTORY: usize = 60;
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 50;
pub const DEFAULT_MAX_RESULTS: usize = 5;
const DEFAULT_BOT_NAME: &str = "assistant";

/// Configuration for the memory pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryChainConfig {
    /// Gate for the whole pipeline (buffering, compression, retrieval)
    pub enabled: bool,

    /// Maximum turns kept per session buffer
    pub max_history: usize,

    /// Turns since the last reset needed before an assistant turn compresses
    pub compress_threshold: usize,

    /// Speaker label used for assistant turns
    pub bot_name: String,

    /// Embedding provider for newly created collections.
    /// When unset, the first provider the store advertises is used.
    pub embedding_provider: Option<String>,

    /// Maximum number of retrieved excerpts injected per request
    pub max_results: usize,

    /// Sessions idle longer than this are evicted from the registry
    pub idle_ttl_secs: Option<u64>,

    /// Upper bound on a single summarization call
    pub summary_timeout_secs: Option<u64>,

    /// Directory for session snapshots written on shutdown
    pub sessions_dir: Option<PathBuf>,

    /// Text generation backend
    pub generator: GeneratorConfig,
}

/// Settings for the HTTP chat-completions generator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var("MEMORYCHAIN_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            // ~300 token summaries plus headroom
            max_tokens: 512,
            temperature: 0.2,
            timeout_secs: 60,
        }
    }
}

impl Default for MemoryChainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: DEFAULT_MAX_HISTORY,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            bot_name: DEFAULT_BOT_NAME.to_string(),
            embedding_provider: None,
            max_results: DEFAULT_MAX_RESULTS,
            idle_ttl_secs: None,
            summary_timeout_secs: None,
            sessions_dir: None,
            generator: GeneratorConfig::default(),
        }
    }
}

impl MemoryChainConfig {
    /// Default config file location: `<config dir>/memorychain/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("memorychain").join("config.toml"))
    }

    /// Load configuration from a TOML file. A missing file yields defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&content)?;
        info!(
            "Loaded config from {} (max_history={}, compress_threshold={}, enabled={})",
            path.display(),
            config.max_history,
            config.compress_threshold,
            config.enabled
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline degenerate
    pub fn validate(&self) -> Result<()> {
        if self.max_history == 0 {
            return Err(MemoryChainError::Config(
                "max_history must be at least 1".to_string(),
            ));
        }
        if self.compress_threshold == 0 {
            return Err(MemoryChainError::Config(
                "compress_threshold must be at least 1".to_string(),
            ));
        }
        if self.bot_name.trim().is_empty() {
            return Err(MemoryChainError::Config("bot_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    pub fn with_bot_name(mut self, name: impl Into<String>) -> Self {
        self.bot_name = name.into();
        self
    }

    pub fn with_embedding_provider(mut self, provider: impl Into<String>) -> Self {
        self.embedding_provider = Some(provider.into());
        self
    }

    pub fn with_sessions_dir(mut self, dir: PathBuf) -> Self {
        self.sessions_dir = Some(dir);
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }

    pub fn summary_timeout(&self) -> Option<Duration> {
        self.summary_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MemoryChainConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_history, 60);
        assert_eq!(config.compress_threshold, 50);
        assert_eq!(config.bot_name, "assistant");
        assert!(config.embedding_provider.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = MemoryChainConfig::from_toml_str(
            r#"
compress_threshold = 10
bot_name = "lumi"

[generator]
model = "local-model"
"#,
        )
        .unwrap();
        assert_eq!(config.compress_threshold, 10);
        assert_eq!(config.max_history, DEFAULT_MAX_HISTORY);
        assert_eq!(config.bot_name, "lumi");
        assert_eq!(config.generator.model, "local-model");
        assert_eq!(config.generator.max_tokens, 512);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = MemoryChainConfig::from_toml_str("compress_threshold = 0").unwrap_err();
        assert!(matches!(err, MemoryChainError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = MemoryChainConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config.max_history, DEFAULT_MAX_HISTORY);
    }
}
