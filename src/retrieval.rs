//! Retrieval augmentation.
//!
//! Before a user turn is forwarded for a reply, the session's memory
//! collection is searched with the raw message text and the hits are
//! appended to the request's system context. Retrieval never fails the
//! request: a missing collection or a store error just means no extra
//! context.

use crate::session::{sanitize, SessionKey};
use crate::store::{MemoryStore, QueryHit};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header placed above injected memories in the system context
pub const MEMORY_CONTEXT_HEADER: &str = "Relevant memories from earlier in this conversation:";

const COLLECTION_PREFIX: &str = "memorychain";

/// Name of the memory collection that holds summaries for `key`.
///
/// Deterministic and one-to-one: distinct keys, including a private and a
/// group session sharing an id, never share a collection.
pub fn collection_name(key: &SessionKey) -> String {
    format!("{}_{}_{}", COLLECTION_PREFIX, key.scope, sanitize(&key.id))
}

/// Excerpts retrieved for one request, in store relevance order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Augmentation {
    pub hits: Vec<QueryHit>,
}

impl Augmentation {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// `"{document_name}:\n{excerpt}"` per hit, separated by blank lines
    pub fn render(&self) -> String {
        self.hits
            .iter()
            .map(|hit| format!("{}:\n{}", hit.document_name, hit.excerpt))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// The outbound request as far as memory is concerned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub system_prompt: String,
    pub user_message: String,
}

impl RequestContext {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
        }
    }

    /// Append retrieved memories to the system context. No-op when empty.
    pub fn apply(&mut self, augmentation: &Augmentation) {
        if augmentation.is_empty() {
            return;
        }
        if !self.system_prompt.is_empty() {
            self.system_prompt.push_str("\n\n");
        }
        self.system_prompt.push_str(MEMORY_CONTEXT_HEADER);
        self.system_prompt.push('\n');
        self.system_prompt.push_str(&augmentation.render());
    }
}

/// Queries the memory store on behalf of incoming user turns
pub struct RetrievalAugmenter {
    store: Arc<dyn MemoryStore>,
    max_results: usize,
}

impl RetrievalAugmenter {
    pub fn new(store: Arc<dyn MemoryStore>, max_results: usize) -> Self {
        Self { store, max_results }
    }

    /// Look up memories relevant to `user_text` in the session's collection.
    pub async fn augment(&self, key: &SessionKey, user_text: &str) -> Augmentation {
        let collection = collection_name(key);

        match self.store.collection_exists(&collection).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("No memory collection for {} yet", key);
                return Augmentation::default();
            }
            Err(e) => {
                warn!("Memory lookup for {} failed, continuing without: {}", key, e);
                return Augmentation::default();
            }
        }

        match self.store.query(user_text, &[collection]).await {
            Ok(mut hits) => {
                hits.truncate(self.max_results);
                debug!("Retrieved {} memories for {}", hits.len(), key);
                Augmentation { hits }
            }
            Err(e) => {
                warn!("Memory query for {} failed, continuing without: {}", key, e);
                Augmentation::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_collection_name_is_scope_aware() {
        assert_eq!(
            collection_name(&SessionKey::group("42")),
            "memorychain_group_42"
        );
        assert_ne!(
            collection_name(&SessionKey::group("42")),
            collection_name(&SessionKey::private("42"))
        );
        assert_eq!(
            collection_name(&SessionKey::private("a b/c")),
            "memorychain_private_a_20_b_2f_c"
        );
        assert_ne!(
            collection_name(&SessionKey::private("alice.smith")),
            collection_name(&SessionKey::private("alice_smith"))
        );
    }

    #[test]
    fn test_apply_appends_labeled_excerpts() {
        let mut request = RequestContext::new("You are helpful.", "what did I say?");
        request.apply(&Augmentation {
            hits: vec![
                QueryHit {
                    document_name: "d1".to_string(),
                    excerpt: "first".to_string(),
                },
                QueryHit {
                    document_name: "d2".to_string(),
                    excerpt: "second".to_string(),
                },
            ],
        });
        assert_eq!(
            request.system_prompt,
            format!(
                "You are helpful.\n\n{}\nd1:\nfirst\n\nd2:\nsecond",
                MEMORY_CONTEXT_HEADER
            )
        );
    }

    #[test]
    fn test_apply_empty_is_noop() {
        let mut request = RequestContext::new("sys", "msg");
        request.apply(&Augmentation::default());
        assert_eq!(request.system_prompt, "sys");
    }

    #[tokio::test]
    async fn test_missing_collection_yields_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let augmenter = RetrievalAugmenter::new(store, 5);
        let aug = augmenter.augment(&SessionKey::group("group42"), "hello").await;
        assert!(aug.is_empty());
    }

    #[tokio::test]
    async fn test_results_are_capped() {
        let store =
            Arc::new(InMemoryStore::new().with_embedding_providers(vec!["local".to_string()]));
        let key = SessionKey::private("u1");
        let handle = store
            .ensure_collection(&collection_name(&key), "local")
            .await
            .unwrap();
        for i in 0..4 {
            store
                .write_document(&handle, &format!("doc{}", i), "pizza night")
                .await
                .unwrap();
        }

        let augmenter = RetrievalAugmenter::new(store, 2);
        let aug = augmenter.augment(&key, "pizza").await;
        assert_eq!(aug.hits.len(), 2);
        assert_eq!(aug.hits[0].document_name, "doc0");
    }
}
