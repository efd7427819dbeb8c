//! In-process document store with token-overlap scoring.
//!
//! Serves local setups and tests; production deployments point the facade at
//! the external vector index instead.

use crate::store::{KnowledgeStore, SearchOptions, Snippet, StoreError};
use std::collections::HashSet;
use std::sync::RwLock;

struct Doc {
    title: String,
    content: String,
    category: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<Vec<Doc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, title: impl Into<String>, content: impl Into<String>) {
        self.add_categorized(title, content, None);
    }

    pub fn add_categorized(
        &self,
        title: impl Into<String>,
        content: impl Into<String>,
        category: Option<String>,
    ) {
        self.docs.write().expect("docs lock").push(Doc {
            title: title.into(),
            content: content.into(),
            category,
        });
    }

    pub fn len(&self) -> usize {
        self.docs.read().expect("docs lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard-style overlap between query tokens and document tokens.
fn score(query_tokens: &HashSet<String>, doc_text: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = tokenize(doc_text);
    let hits = query_tokens.intersection(&doc_tokens).count();
    hits as f32 / query_tokens.len() as f32
}

#[async_trait::async_trait]
impl KnowledgeStore for MemoryStore {
    fn supports_embeddings(&self) -> bool {
        false
    }

    async fn semantic_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Snippet>, StoreError> {
        // No embedding backend; the overlap score is the similarity proxy.
        self.keyword_search(query, options).await
    }

    async fn keyword_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Snippet>, StoreError> {
        let query_tokens = tokenize(query);
        let docs = self.docs.read().expect("docs lock");

        let mut scored: Vec<(f32, Snippet)> = docs
            .iter()
            .filter(|d| match (&options.category, &d.category) {
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .map(|d| {
                let s = score(&query_tokens, &format!("{} {}", d.title, d.content));
                (
                    s,
                    Snippet {
                        title: d.title.clone(),
                        content: d.content.clone(),
                        similarity: Some(s),
                    },
                )
            })
            .filter(|(s, _)| *s >= options.threshold)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(options.limit)
            .map(|(_, snip)| snip)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.add("auth", "login flow uses session tokens and refresh rotation");
        store.add("billing", "invoices are generated monthly from usage records");
        store.add_categorized(
            "deploy",
            "deployment happens through the release pipeline",
            Some("ops".into()),
        );
        store
    }

    #[tokio::test]
    async fn ranks_by_overlap() {
        let store = seeded();
        let opts = SearchOptions::default().with_threshold(0.1);
        let hits = store.keyword_search("session tokens login", &opts).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].title, "auth");
    }

    #[tokio::test]
    async fn threshold_filters_weak_matches() {
        let store = seeded();
        let opts = SearchOptions::default().with_threshold(0.9);
        let hits = store.keyword_search("completely unrelated words", &opts).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn category_filter() {
        let store = seeded();
        let mut opts = SearchOptions::default().with_threshold(0.1);
        opts.category = Some("ops".into());
        let hits = store.keyword_search("release pipeline deployment", &opts).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "deploy");
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store.add(format!("doc{}", i), "shared keyword corpus entry");
        }
        let opts = SearchOptions::default().with_threshold(0.1).with_limit(3);
        let hits = store.keyword_search("shared keyword corpus", &opts).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
}
