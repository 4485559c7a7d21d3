//! On-disk session snapshots.
//!
//! Buffers are in-memory only while the service runs. On shutdown each one
//! is written to `{sessions_dir}/{scope}_{id}.json`; on start they are read
//! back so a restart does not throw away the current accumulation cycle.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::buffer::{SessionBuffer, SessionKey};

/// One persisted session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub saved_at: DateTime<Utc>,
    pub buffer: SessionBuffer,
}

/// Manages per-session snapshot files.
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Create a session store. Creates the directory if needed.
    pub async fn new(sessions_dir: &Path) -> Result<Self> {
        fs::create_dir_all(sessions_dir).await?;
        Ok(Self {
            sessions_dir: sessions_dir.to_path_buf(),
        })
    }

    /// Write one buffer, replacing any earlier snapshot of the same session.
    pub async fn save(&self, buffer: &SessionBuffer) -> Result<()> {
        let snapshot = SessionSnapshot {
            saved_at: Utc::now(),
            buffer: buffer.clone(),
        };

        let path = self.session_path(buffer.key());
        let content = serde_json::to_string_pretty(&snapshot)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!("Saved session {} ({} turns)", buffer.key(), buffer.len());
        Ok(())
    }

    /// Write every buffer; empty buffers remove their stale file instead.
    pub async fn save_all(&self, buffers: &[SessionBuffer]) -> Result<usize> {
        let mut saved = 0;
        for buffer in buffers {
            if buffer.is_empty() {
                self.remove(buffer.key()).await?;
                continue;
            }
            self.save(buffer).await?;
            saved += 1;
        }
        info!("Persisted {} sessions to {}", saved, self.sessions_dir.display());
        Ok(saved)
    }

    /// Load a single session snapshot, if present and readable.
    pub async fn load(&self, key: &SessionKey) -> Result<Option<SessionBuffer>> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Self::read_snapshot(&path).await?.map(|s| s.buffer))
    }

    /// Load every snapshot in the directory. Unparsable files are skipped.
    pub async fn load_all(&self) -> Result<Vec<SessionBuffer>> {
        let mut buffers = Vec::new();
        let mut entries = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(snapshot) = Self::read_snapshot(&path).await? {
                buffers.push(snapshot.buffer);
            }
        }
        info!("Loaded {} sessions from {}", buffers.len(), self.sessions_dir.display());
        Ok(buffers)
    }

    /// Delete the snapshot of a session, if any
    pub async fn remove(&self, key: &SessionKey) -> Result<()> {
        let path = self.session_path(key);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn read_snapshot(path: &Path) -> Result<Option<SessionSnapshot>> {
        let content = fs::read_to_string(path).await?;
        match serde_json::from_str::<SessionSnapshot>(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Failed to parse session file {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn session_path(&self, key: &SessionKey) -> PathBuf {
        self.sessions_dir
            .join(format!("{}_{}.json", key.scope, sanitize(&key.id)))
    }
}

/// Map an arbitrary id onto `[A-Za-z0-9_-]`, one-to-one.
///
/// ASCII letters, digits and `-` pass through. Every other char, `_`
/// included, becomes `_{hex code point}_`, so a literal `_` never appears
/// unescaped and two different ids never share a name.
pub(crate) fn sanitize(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else {
            out.push_str(&format!("_{:x}_", c as u32));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Speaker;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        let key = SessionKey::group("team/chat");
        let mut buffer = SessionBuffer::new(key.clone(), 10);
        buffer.append(Speaker::User, "alice", "hello");
        buffer.append(Speaker::Assistant, "bot", "hi alice");
        store.save(&buffer).await.unwrap();

        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.turn_count_since_reset(), 2);
        assert_eq!(loaded.next_sequence_no(), 2);
        assert!(dir.path().join("group_team_2f_chat.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();
        fs::write(dir.path().join("group_bad.json"), "{not json")
            .await
            .unwrap();

        let mut buffer = SessionBuffer::new(SessionKey::private("u1"), 10);
        buffer.append(Speaker::User, "bob", "ping");
        store.save(&buffer).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key(), &SessionKey::private("u1"));
    }

    #[test]
    fn test_sanitize_is_one_to_one() {
        assert_eq!(sanitize("alice-01"), "alice-01");
        assert_eq!(sanitize("alice.smith"), "alice_2e_smith");
        assert_eq!(sanitize("alice_smith"), "alice_5f_smith");
        assert_ne!(sanitize("a_2e_b"), sanitize("a.b"));
        assert_eq!(sanitize("猫"), "_732b_");
    }

    #[tokio::test]
    async fn test_similar_ids_get_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        let dotted = SessionKey::private("alice.smith");
        let underscored = SessionKey::private("alice_smith");
        let mut a = SessionBuffer::new(dotted.clone(), 10);
        a.append(Speaker::User, "alice", "from the dotted account");
        let mut b = SessionBuffer::new(underscored.clone(), 10);
        b.append(Speaker::User, "alice", "from the underscored account");
        b.append(Speaker::User, "alice", "second message");
        store.save_all(&[a, b]).await.unwrap();

        assert_ne!(store.session_path(&dotted), store.session_path(&underscored));
        assert_eq!(store.load(&dotted).await.unwrap().unwrap().len(), 1);
        assert_eq!(store.load(&underscored).await.unwrap().unwrap().len(), 2);
        assert_eq!(store.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_all_removes_empty_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        let key = SessionKey::private("u1");
        let mut buffer = SessionBuffer::new(key.clone(), 10);
        buffer.append(Speaker::User, "bob", "ping");
        store.save(&buffer).await.unwrap();

        buffer.reset();
        assert_eq!(store.save_all(&[buffer]).await.unwrap(), 0);
        assert!(store.load(&key).await.unwrap().is_none());
    }
}
