//! Memory store interface and an in-process implementation.
//!
//! The memory store is the durable, searchable side of the system: one
//! collection per session, each holding write-once summary documents.
//! Semantic search itself belongs to whatever backend implements
//! [`MemoryStore`]; [`InMemoryStore`] ranks by word overlap and exists for
//! tests and local replays.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::debug;

/// Maximum characters of a document returned as an excerpt
const EXCERPT_MAX_CHARS: usize = 600;

/// Errors reported by a memory store backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("unknown embedding provider: {0}")]
    UnknownEmbeddingProvider(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Reference to an existing collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionHandle {
    pub name: String,
    /// Embedding provider the collection was created with
    pub embedding_provider: String,
}

/// One retrieval result, in relevance order as decided by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHit {
    pub document_name: String,
    pub excerpt: String,
}

/// Durable, per-session document store with retrieval by free text
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Handle to an existing collection, or `None` if it was never created
    async fn open_collection(&self, name: &str) -> Result<Option<CollectionHandle>, StoreError>;

    /// Whether a collection with this name exists
    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.open_collection(name).await?.is_some())
    }

    /// Get the collection, creating it with `embedding_provider` if missing
    async fn ensure_collection(
        &self,
        name: &str,
        embedding_provider: &str,
    ) -> Result<CollectionHandle, StoreError>;

    /// Store a new document. Returns only once the write is durable.
    async fn write_document(
        &self,
        collection: &CollectionHandle,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Search the named collections, most relevant first
    async fn query(&self, text: &str, collections: &[String]) -> Result<Vec<QueryHit>, StoreError>;

    /// Embedding providers available for new collections, preferred first
    async fn embedding_providers(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredDocument {
    name: String,
    content: String,
    words: HashSet<String>,
}

#[derive(Debug, Default)]
struct Collection {
    embedding_provider: String,
    documents: Vec<StoredDocument>,
}

/// Process-local store ranking documents by shared words with the query
#[derive(Debug, Default)]
pub struct InMemoryStore {
    embedding_providers: Vec<String>,
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedding_providers(mut self, providers: Vec<String>) -> Self {
        self.embedding_providers = providers;
        self
    }

    /// Names of the documents in a collection, oldest first
    pub async fn document_names(&self, collection: &str) -> Vec<String> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.documents.iter().map(|d| d.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Full content of a document
    pub async fn document(&self, collection: &str, name: &str) -> Option<String> {
        self.collections
            .read()
            .await
            .get(collection)?
            .documents
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.content.clone())
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn open_collection(&self, name: &str) -> Result<Option<CollectionHandle>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .map(|c| CollectionHandle {
                name: name.to_string(),
                embedding_provider: c.embedding_provider.clone(),
            }))
    }

    async fn ensure_collection(
        &self,
        name: &str,
        embedding_provider: &str,
    ) -> Result<CollectionHandle, StoreError> {
        if !self.embedding_providers.iter().any(|p| p == embedding_provider) {
            return Err(StoreError::UnknownEmbeddingProvider(
                embedding_provider.to_string(),
            ));
        }

        let mut collections = self.collections.write().await;
        let collection = collections.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating collection {} ({})", name, embedding_provider);
            Collection {
                embedding_provider: embedding_provider.to_string(),
                documents: Vec::new(),
            }
        });
        Ok(CollectionHandle {
            name: name.to_string(),
            embedding_provider: collection.embedding_provider.clone(),
        })
    }

    async fn write_document(
        &self,
        collection: &CollectionHandle,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(&collection.name)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.name.clone()))?;
        target.documents.push(StoredDocument {
            name: name.to_string(),
            content: content.to_string(),
            words: words(content),
        });
        Ok(())
    }

    async fn query(&self, text: &str, collections: &[String]) -> Result<Vec<QueryHit>, StoreError> {
        let query_words = words(text);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }

        let all = self.collections.read().await;
        let mut scored: Vec<(usize, &StoredDocument)> = Vec::new();
        for name in collections {
            let Some(collection) = all.get(name) else {
                continue;
            };
            for doc in &collection.documents {
                let score = doc.words.intersection(&query_words).count();
                if score > 0 {
                    scored.push((score, doc));
                }
            }
        }
        // Stable sort: equal scores keep insertion order
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .map(|(_, doc)| QueryHit {
                document_name: doc.name.clone(),
                excerpt: excerpt(&doc.content),
            })
            .collect())
    }

    async fn embedding_providers(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.embedding_providers.clone())
    }
}

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+").unwrap())
}

fn words(text: &str) -> HashSet<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn excerpt(content: &str) -> String {
    match content.char_indices().nth(EXCERPT_MAX_CHARS) {
        Some((end, _)) => format!("{}...", &content[..end]),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new().with_embedding_providers(vec!["local".to_string()])
    }

    #[tokio::test]
    async fn test_ensure_collection_is_idempotent() {
        let store = store();
        assert!(!store.collection_exists("c").await.unwrap());
        let a = store.ensure_collection("c", "local").await.unwrap();
        let b = store.ensure_collection("c", "local").await.unwrap();
        assert_eq!(a, b);
        assert!(store.collection_exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let err = store().ensure_collection("c", "remote").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownEmbeddingProvider(_)));
    }

    #[tokio::test]
    async fn test_query_ranks_by_overlap_and_scopes_collections() {
        let store = store();
        let c = store.ensure_collection("c", "local").await.unwrap();
        let other = store.ensure_collection("other", "local").await.unwrap();
        store
            .write_document(&c, "weak", "we talked about the weather")
            .await
            .unwrap();
        store
            .write_document(&c, "strong", "Alice plans a trip to Kyoto next week")
            .await
            .unwrap();
        store
            .write_document(&other, "leak", "Kyoto trip for someone else")
            .await
            .unwrap();

        let hits = store
            .query("when is the kyoto trip", &["c".to_string()])
            .await
            .unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.document_name.as_str()).collect();
        assert_eq!(names, vec!["strong", "weak"]);
    }

    #[tokio::test]
    async fn test_write_to_missing_collection_fails() {
        let handle = CollectionHandle {
            name: "ghost".to_string(),
            embedding_provider: "local".to_string(),
        };
        let err = store().write_document(&handle, "d", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::CollectionNotFound(_)));
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(EXCERPT_MAX_CHARS + 10);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), EXCERPT_MAX_CHARS + 3);
    }
}
