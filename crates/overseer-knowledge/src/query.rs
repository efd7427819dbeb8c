//! Search facade with graceful degradation

use crate::store::{KnowledgeStore, SearchOptions, Snippet};
use std::sync::Arc;
use tracing::warn;

/// Uniform entry point for semantic/keyword retrieval. Absence of the store
/// or of embedding capability degrades instead of failing: no embeddings →
/// keyword search; no store or store error → empty list.
#[derive(Clone, Default)]
pub struct KnowledgeQuery {
    store: Option<Arc<dyn KnowledgeStore>>,
}

impl KnowledgeQuery {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A facade with no backing store; every search returns the empty list.
    pub fn disconnected() -> Self {
        Self { store: None }
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_some()
    }

    pub async fn semantic_search(&self, query: &str, options: &SearchOptions) -> Vec<Snippet> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        let result = if store.supports_embeddings() {
            store.semantic_search(query, options).await
        } else {
            store.keyword_search(query, options).await
        };

        match result {
            Ok(snippets) => snippets,
            Err(e) => {
                warn!(error = %e, query = %truncate(query, 80), "knowledge search failed, returning empty");
                Vec::new()
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
