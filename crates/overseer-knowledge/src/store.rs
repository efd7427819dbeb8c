//! Document store seam

use serde::{Deserialize, Serialize};

/// One retrieved passage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snippet {
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub limit: usize,
    pub threshold: f32,
    pub category: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.4,
            category: None,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Backend contract for the document store.
#[async_trait::async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Whether embedding-based search is available right now.
    fn supports_embeddings(&self) -> bool;

    async fn semantic_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Snippet>, StoreError>;

    async fn keyword_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Snippet>, StoreError>;
}
