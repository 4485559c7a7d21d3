//! Memorychain - rolling conversational memory for chat sessions
//!
//! Keeps a bounded buffer of recent turns per conversation and:
//! - Compresses the buffer into a durable summary once a threshold is reached
//! - Stores summaries in a per-session collection of a searchable memory store
//! - Re-injects relevant summaries into later requests via retrieval

pub mod config;
pub mod generator;
pub mod memory;
pub mod retrieval;
pub mod session;
pub mod store;

pub use config::{GeneratorConfig, MemoryChainConfig};
pub use generator::{GeneratorError, HttpTextGenerator, TextGenerator};
pub use memory::{CompressionOutcome, MemoryChain, Summarizer, SummarizerError};
pub use retrieval::{Augmentation, RequestContext, RetrievalAugmenter};
pub use session::{ScopeKind, SessionBuffer, SessionKey, SessionRegistry, Speaker, Turn};
pub use store::{CollectionHandle, InMemoryStore, MemoryStore, QueryHit, StoreError};

/// Result type for Memorychain operations
pub type Result<T> = std::result::Result<T, MemoryChainError>;

/// Errors that can occur in Memorychain
#[derive(Debug, thiserror::Error)]
pub enum MemoryChainError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Compression error: {0}")]
    Compression(#[from] SummarizerError),

    #[error("Memory store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
