//! Session module for Memorychain
//!
//! Per-conversation turn buffers, the registry that owns them, and on-disk
//! snapshots used across restarts.

mod buffer;
mod registry;
mod store;

pub use buffer::{
    BufferSnapshot, ScopeKind, SessionBuffer, SessionKey, Speaker, Turn, SUMMARY_POSTAMBLE,
    SUMMARY_PREAMBLE,
};
pub use registry::{SessionEntry, SessionHandle, SessionRegistry};
pub use store::{SessionSnapshot, SessionStore};
pub(crate) use store::sanitize;
