//! Compression-to-storage pipeline.
//!
//! Per session the cycle is:
//!
//! ```text
//! ACCUMULATING --(assistant turn, count >= threshold)--> SUMMARIZING
//! SUMMARIZING  --ok--> PERSISTING --ok--> ACCUMULATING (buffer reset)
//! SUMMARIZING / PERSISTING --err--> ACCUMULATING (turns put back)
//! ```
//!
//! The session lock is held only to append and to snapshot-and-drain the
//! buffer. Summarization and the store write run unlocked, so turns that
//! arrive meanwhile start a new cycle. If the cycle fails, the drained turns
//! are restored in front of them and the next qualifying turn retries.
//! The cycle runs on its own task, so it completes even if the caller that
//! started it is dropped.

use super::summarizer::{Summarizer, SummarizerError};
use super::trigger::should_compress;
use crate::config::MemoryChainConfig;
use crate::retrieval::{collection_name, Augmentation, RequestContext, RetrievalAugmenter};
use crate::session::{
    BufferSnapshot, SessionHandle, SessionKey, SessionRegistry, SessionStore, Speaker,
};
use crate::store::{CollectionHandle, MemoryStore, StoreError};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A finished summary, written once to the session's collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySummary {
    pub session_key: SessionKey,
    pub text: String,
    /// Sequence number of the oldest turn the summary covers
    pub first_sequence_no: u64,
    pub produced_at: DateTime<Utc>,
}

impl MemorySummary {
    pub fn new(session_key: SessionKey, text: String, first_sequence_no: u64) -> Self {
        Self {
            session_key,
            text,
            first_sequence_no,
            produced_at: Utc::now(),
        }
    }

    /// Document name. Cycles never share a first turn, so names are unique
    /// per collection even within one millisecond.
    pub fn document_name(&self) -> String {
        format!(
            "{}_{}_{}",
            collection_name(&self.session_key),
            self.produced_at.format("%Y%m%d%H%M%S%3f"),
            self.first_sequence_no
        )
    }

    /// Stored text. The timestamp anchors relative dates in the summary.
    pub fn document_content(&self) -> String {
        format!("[{}] {}", self.produced_at.format("%Y-%m-%d %H:%M UTC"), self.text)
    }
}

/// What happened to the compression cycle after an assistant turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// The pipeline is switched off in config
    Disabled,
    /// Threshold not reached yet
    NotTriggered,
    /// Threshold reached, but this session's previous cycle is still running
    InFlight,
    /// Summary stored and buffer reset
    Compressed {
        collection: String,
        document_name: String,
    },
}

/// Session memory service: buffers turns, compresses them into summaries
/// and feeds stored summaries back into new requests.
pub struct MemoryChain {
    config: MemoryChainConfig,
    registry: SessionRegistry,
    summarizer: Summarizer,
    store: Arc<dyn MemoryStore>,
    augmenter: RetrievalAugmenter,
    session_store: Option<SessionStore>,
}

impl MemoryChain {
    /// Build the service with an empty registry.
    pub fn new(
        config: MemoryChainConfig,
        summarizer: Summarizer,
        store: Arc<dyn MemoryStore>,
    ) -> Result<Self> {
        config.validate()?;
        if !summarizer.is_configured() {
            warn!("Memorychain started without a text generator; compression will fail until one is configured");
        }
        let summarizer = summarizer.with_timeout(config.summary_timeout());

        Ok(Self {
            registry: SessionRegistry::new(config.max_history),
            augmenter: RetrievalAugmenter::new(store.clone(), config.max_results),
            summarizer,
            store,
            session_store: None,
            config,
        })
    }

    /// Build the service and restore sessions persisted by a previous run.
    pub async fn start(
        config: MemoryChainConfig,
        summarizer: Summarizer,
        store: Arc<dyn MemoryStore>,
    ) -> Result<Self> {
        let mut chain = Self::new(config, summarizer, store)?;
        if let Some(dir) = chain.config.sessions_dir.clone() {
            let session_store = SessionStore::new(&dir).await?;
            let buffers = session_store.load_all().await?;
            chain.registry.restore(buffers).await;
            chain.session_store = Some(session_store);
        }
        info!(
            "Memorychain started (enabled={}, max_history={}, compress_threshold={}, sessions={})",
            chain.config.enabled,
            chain.config.max_history,
            chain.config.compress_threshold,
            chain.registry.len().await
        );
        Ok(chain)
    }

    /// Persist every session buffer, if a sessions directory is configured.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(session_store) = &self.session_store {
            let buffers = self.registry.buffers().await;
            session_store.save_all(&buffers).await?;
        }
        info!("Memorychain stopped");
        Ok(())
    }

    pub fn config(&self) -> &MemoryChainConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Record a user turn and inject relevant memories into `request`.
    ///
    /// Never fails: retrieval problems only mean no extra context.
    pub async fn on_user_turn(
        &self,
        key: &SessionKey,
        speaker_label: &str,
        request: &mut RequestContext,
    ) -> Augmentation {
        if !self.config.enabled {
            return Augmentation::default();
        }

        {
            let handle = self.registry.session(key).await;
            let mut entry = handle.lock().await;
            let seq = entry
                .buffer_mut()
                .append(Speaker::User, speaker_label, request.user_message.as_str());
            debug!("{} user turn #{} from {}", key, seq, speaker_label);
        }

        let augmentation = self.augmenter.augment(key, &request.user_message).await;
        request.apply(&augmentation);
        augmentation
    }

    /// Record an assistant turn and compress the session if it is due.
    ///
    /// On error the buffer still holds every turn and the next assistant
    /// turn retries.
    pub async fn on_assistant_turn(
        &self,
        key: &SessionKey,
        content: &str,
    ) -> std::result::Result<CompressionOutcome, SummarizerError> {
        if !self.config.enabled {
            return Ok(CompressionOutcome::Disabled);
        }

        let handle = self.registry.session(key).await;
        let snapshot = {
            let mut entry = handle.lock().await;
            let seq = entry
                .buffer_mut()
                .append(Speaker::Assistant, self.config.bot_name.as_str(), content);
            debug!("{} assistant turn #{}", key, seq);

            if !should_compress(entry.buffer(), true, self.config.compress_threshold) {
                return Ok(CompressionOutcome::NotTriggered);
            }
            if entry.is_compressing() {
                debug!("{} reached threshold while a compression is running", key);
                return Ok(CompressionOutcome::InFlight);
            }
            entry.set_compressing(true);
            entry.buffer_mut().take_snapshot()
        };

        info!(
            "Compressing {} ({} turns since last summary)",
            key, snapshot.turn_count
        );

        // The cycle runs on its own task so a dropped caller cannot strand
        // the drained turns or leave the session flagged as compressing.
        let job = CompressionJob {
            key: key.clone(),
            summarizer: self.summarizer.clone(),
            store: self.store.clone(),
            embedding_provider: self.config.embedding_provider.clone(),
        };
        let fallback = snapshot.clone();
        let task = tokio::spawn(job.run(handle.clone(), snapshot));

        match task.await {
            Ok(result) => result,
            Err(e) => {
                let mut entry = handle.lock().await;
                entry.buffer_mut().restore(fallback);
                entry.set_compressing(false);
                error!("Compression task for {} died, turns kept: {}", key, e);
                Err(SummarizerError::GenerationFailure(format!(
                    "compression task failed: {}",
                    e
                )))
            }
        }
    }

    /// Administrative reset of one session's buffer
    pub async fn reset_session(&self, key: &SessionKey) -> bool {
        self.registry.reset(key).await
    }

    /// Evict sessions idle past the configured TTL. No-op without a TTL.
    pub async fn evict_idle(&self) -> usize {
        match self.config.idle_ttl() {
            Some(ttl) => self.registry.evict_idle(ttl).await,
            None => 0,
        }
    }

    /// Run idle eviction every `period` until the returned task is aborted.
    pub fn spawn_idle_eviction(self: &Arc<Self>, period: Duration) -> Option<JoinHandle<()>> {
        self.config.idle_ttl()?;
        let chain = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                chain.evict_idle().await;
            }
        }))
    }
}

/// One SUMMARIZING then PERSISTING pass, owning everything it needs
struct CompressionJob {
    key: SessionKey,
    summarizer: Summarizer,
    store: Arc<dyn MemoryStore>,
    embedding_provider: Option<String>,
}

impl CompressionJob {
    /// Run the cycle and commit its result to the session: clear the flag
    /// on success, put the turns back on failure.
    async fn run(
        self,
        handle: SessionHandle,
        snapshot: BufferSnapshot,
    ) -> std::result::Result<CompressionOutcome, SummarizerError> {
        let first_sequence_no = snapshot.first_sequence_no().unwrap_or_default();
        let result = self.compress(&snapshot.prompt, first_sequence_no).await;

        let mut entry = handle.lock().await;
        match result {
            Ok((collection, document_name)) => {
                entry.set_compressing(false);
                info!("Stored summary {} for {}", document_name, self.key);
                Ok(CompressionOutcome::Compressed {
                    collection,
                    document_name,
                })
            }
            Err(e) => {
                entry.buffer_mut().restore(snapshot);
                entry.set_compressing(false);
                match &e {
                    SummarizerError::Unconfigured | SummarizerError::NoEmbeddingCapability => {
                        error!("Compression for {} aborted, turns kept: {}", self.key, e)
                    }
                    _ => warn!("Compression for {} failed, will retry: {}", self.key, e),
                }
                Err(e)
            }
        }
    }

    /// Returns (collection, document name)
    async fn compress(
        &self,
        prompt: &str,
        first_sequence_no: u64,
    ) -> std::result::Result<(String, String), SummarizerError> {
        let text = self.summarizer.summarize(prompt).await?;
        let summary = MemorySummary::new(self.key.clone(), text, first_sequence_no);

        let collection = self.ensure_collection().await?;
        let document_name = summary.document_name();
        self.store
            .write_document(&collection, &document_name, &summary.document_content())
            .await
            .map_err(store_write_failure)?;
        Ok((collection.name, document_name))
    }

    async fn ensure_collection(&self) -> std::result::Result<CollectionHandle, SummarizerError> {
        let name = collection_name(&self.key);
        if let Some(handle) = self
            .store
            .open_collection(&name)
            .await
            .map_err(store_write_failure)?
        {
            return Ok(handle);
        }

        let provider = self.resolve_embedding_provider().await?;
        info!("Creating memory collection {} with embedding provider {}", name, provider);
        self.store
            .ensure_collection(&name, &provider)
            .await
            .map_err(store_write_failure)
    }

    /// Configured provider, else the first one the store offers
    async fn resolve_embedding_provider(&self) -> std::result::Result<String, SummarizerError> {
        if let Some(provider) = &self.embedding_provider {
            return Ok(provider.clone());
        }
        self.store
            .embedding_providers()
            .await
            .map_err(store_write_failure)?
            .into_iter()
            .next()
            .ok_or(SummarizerError::NoEmbeddingCapability)
    }
}

fn store_write_failure(e: StoreError) -> SummarizerError {
    SummarizerError::StoreWriteFailure(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{GeneratorError, TextGenerator};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, _prompt: &str) -> std::result::Result<String, GeneratorError> {
            Ok("they talked".to_string())
        }
    }

    fn chain(store: Arc<InMemoryStore>, threshold: usize) -> MemoryChain {
        let config = MemoryChainConfig::default()
            .with_compress_threshold(threshold)
            .with_bot_name("bot");
        MemoryChain::new(config, Summarizer::new(Arc::new(Echo)), store).unwrap()
    }

    fn local_store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new().with_embedding_providers(vec!["local".to_string()]))
    }

    #[test]
    fn test_summary_document_naming() {
        let summary = MemorySummary::new(SessionKey::group("g"), "text".to_string(), 7);
        assert!(summary.document_name().starts_with("memorychain_group_g_"));
        assert!(summary.document_name().ends_with("_7"));
        assert!(summary.document_content().ends_with("] text"));
    }

    #[tokio::test]
    async fn test_user_turns_never_compress() {
        let store = local_store();
        let chain = chain(store.clone(), 1);
        let key = SessionKey::private("u");
        for _ in 0..3 {
            let mut request = RequestContext::new("", "hello");
            chain.on_user_turn(&key, "alice", &mut request).await;
        }
        assert!(store.collection_names().await.is_empty());

        let outcome = chain.on_assistant_turn(&key, "hi").await.unwrap();
        assert!(matches!(outcome, CompressionOutcome::Compressed { .. }));
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let store = local_store();
        let config = MemoryChainConfig::default()
            .with_compress_threshold(1)
            .with_enabled(false);
        let chain = MemoryChain::new(config, Summarizer::new(Arc::new(Echo)), store).unwrap();
        let key = SessionKey::private("u");

        let mut request = RequestContext::new("sys", "hello");
        assert!(chain.on_user_turn(&key, "alice", &mut request).await.is_empty());
        assert_eq!(
            chain.on_assistant_turn(&key, "hi").await.unwrap(),
            CompressionOutcome::Disabled
        );
        assert!(chain.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_configured_provider_is_used() {
        let store = Arc::new(
            InMemoryStore::new()
                .with_embedding_providers(vec!["first".to_string(), "second".to_string()]),
        );
        let config = MemoryChainConfig::default()
            .with_compress_threshold(1)
            .with_embedding_provider("second");
        let chain = MemoryChain::new(config, Summarizer::new(Arc::new(Echo)), store.clone())
            .unwrap();
        let key = SessionKey::group("g");
        chain.on_assistant_turn(&key, "hi").await.unwrap();

        let handle = store
            .open_collection(&collection_name(&key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.embedding_provider, "second");
    }

    #[tokio::test]
    async fn test_no_embedding_provider_keeps_turns() {
        let store = Arc::new(InMemoryStore::new());
        let chain = chain(store, 1);
        let key = SessionKey::group("g");

        let err = chain.on_assistant_turn(&key, "hi").await.unwrap_err();
        assert!(matches!(err, SummarizerError::NoEmbeddingCapability));

        let handle = chain.registry().get(&key).await.unwrap();
        let entry = handle.lock().await;
        assert_eq!(entry.buffer().len(), 1);
        assert_eq!(entry.buffer().turn_count_since_reset(), 1);
        assert!(!entry.is_compressing());
    }
}
