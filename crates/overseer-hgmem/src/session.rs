//! Retrieval sessions and their durable state

use crate::graph::Hypergraph;
use chrono::{DateTime, Utc};
use overseer_core::{Error, Result};
use overseer_store::JsonState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

pub const DEFAULT_MAX_STEPS: u32 = 6;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Active,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubqueryRecord {
    pub step: u32,
    pub query: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_hyperedge_id: Option<String>,
}

/// One hypergraph retrieval run over a target query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub query: String,
    pub project: String,
    #[serde(default)]
    pub step: u32,
    pub max_steps: u32,
    #[serde(default)]
    pub state: SessionState,
    #[serde(default)]
    pub subquery_history: Vec<SubqueryRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(query: impl Into<String>, project: impl Into<String>, max_steps: u32) -> Self {
        Self {
            id: format!("hgs-{}", overseer_core::new_id()),
            query: query.into(),
            project: project.into(),
            step: 0,
            max_steps,
            state: SessionState::Active,
            subquery_history: Vec::new(),
            response: None,
            tokens_used: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionEntry {
    session: Session,
    graph: Hypergraph,
}

/// Durable session registry; sessions share no mutable state with each other.
pub struct SessionStore {
    state: JsonState,
    entries: RwLock<Vec<SessionEntry>>,
}

impl SessionStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let state = JsonState::new(path);
        let entries: Vec<SessionEntry> = state.load_or_default();
        Self {
            state,
            entries: RwLock::new(entries),
        }
    }

    fn persist(&self, entries: &[SessionEntry]) {
        if let Err(e) = self.state.save(&entries.to_vec()) {
            warn!(error = %e, "failed to persist hgmem sessions");
        }
    }

    pub async fn create(&self, session: Session) -> Session {
        let mut entries = self.entries.write().await;
        entries.push(SessionEntry {
            session: session.clone(),
            graph: Hypergraph::new(),
        });
        self.persist(&entries);
        session
    }

    pub async fn get(&self, id: &str) -> Result<(Session, Hypergraph)> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.session.id == id)
            .map(|e| (e.session.clone(), e.graph.clone()))
            .ok_or_else(|| Error::not_found("session", id))
    }

    pub async fn list(&self) -> Vec<Session> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.session.clone())
            .collect()
    }

    /// Mutate one session and its graph under the writer lock, then persist.
    pub async fn update<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Session, &mut Hypergraph) -> R,
    ) -> Result<R> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.session.id == id)
            .ok_or_else(|| Error::not_found("session", id))?;
        let result = mutate(&mut entry.session, &mut entry.graph);
        self.persist(&entries);
        Ok(result)
    }
}
