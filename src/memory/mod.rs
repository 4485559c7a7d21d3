//! Memory module for Memorychain
//!
//! Decides when a session is due for compression, produces the summary and
//! stores it, keeping every turn if any step fails.

mod pipeline;
mod summarizer;
mod trigger;

pub use pipeline::{CompressionOutcome, MemoryChain, MemorySummary};
pub use summarizer::{Summarizer, SummarizerError};
pub use trigger::should_compress;
