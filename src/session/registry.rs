//! Process-wide map from session key to session buffer.
//!
//! The registry is created explicitly and handed to whoever needs it; there
//! is no global instance. Each session lives behind its own async mutex, so
//! work on different keys never contends, while the map itself is only
//! locked long enough to look up or insert a handle.

use super::buffer::{SessionBuffer, SessionKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

/// Shared handle to one session's state
pub type SessionHandle = Arc<Mutex<SessionEntry>>;

/// Mutable state of one session, guarded by the session mutex
#[derive(Debug)]
pub struct SessionEntry {
    buffer: SessionBuffer,
    /// A compression cycle for this session is between snapshot and commit
    compressing: bool,
    last_active: Instant,
}

impl SessionEntry {
    fn new(buffer: SessionBuffer) -> Self {
        Self {
            buffer,
            compressing: false,
            last_active: Instant::now(),
        }
    }

    pub fn buffer(&self) -> &SessionBuffer {
        &self.buffer
    }

    /// Mutable access; counts as activity for idle eviction
    pub fn buffer_mut(&mut self) -> &mut SessionBuffer {
        self.last_active = Instant::now();
        &mut self.buffer
    }

    pub fn is_compressing(&self) -> bool {
        self.compressing
    }

    pub(crate) fn set_compressing(&mut self, compressing: bool) {
        self.compressing = compressing;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// Keyed store of session buffers
pub struct SessionRegistry {
    max_history: usize,
    sessions: RwLock<HashMap<SessionKey, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session for `key`, creating an empty one on first use.
    pub async fn session(&self, key: &SessionKey) -> SessionHandle {
        if let Some(handle) = self.sessions.read().await.get(key) {
            return handle.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating session buffer for {}", key);
                Arc::new(Mutex::new(SessionEntry::new(SessionBuffer::new(
                    key.clone(),
                    self.max_history,
                ))))
            })
            .clone()
    }

    /// Get the session for `key` without creating it
    pub async fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<SessionKey> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Administrative reset: clear a session's turns but keep it registered.
    ///
    /// Returns false if the session does not exist.
    pub async fn reset(&self, key: &SessionKey) -> bool {
        let Some(handle) = self.get(key).await else {
            return false;
        };
        handle.lock().await.buffer_mut().reset();
        info!("Session {} reset", key);
        true
    }

    /// Drop sessions that have been idle for at least `ttl`.
    ///
    /// A session is kept if anything else holds its handle (a request in
    /// progress) or a compression cycle is pending, so no turn is appended
    /// to a buffer that has already left the map.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|key, handle| {
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            let Ok(entry) = handle.try_lock() else {
                return true;
            };
            let keep = entry.is_compressing() || entry.idle_for() < ttl;
            if !keep {
                debug!("Evicting idle session {} ({:?} idle)", key, entry.idle_for());
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("Evicted {} idle sessions", evicted);
        }
        evicted
    }

    /// Copy every buffer, for persistence on shutdown
    pub async fn buffers(&self) -> Vec<SessionBuffer> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut buffers = Vec::with_capacity(handles.len());
        for handle in handles {
            buffers.push(handle.lock().await.buffer().clone());
        }
        buffers
    }

    /// Register previously persisted buffers, replacing any existing entry
    pub async fn restore(&self, buffers: Vec<SessionBuffer>) {
        let mut sessions = self.sessions.write().await;
        for mut buffer in buffers {
            buffer.set_max_history(self.max_history);
            let key = buffer.key().clone();
            sessions.insert(key, Arc::new(Mutex::new(SessionEntry::new(buffer))));
        }
    }
}
