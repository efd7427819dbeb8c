//! Durable task records with restart recovery

use crate::state::JsonState;
use chrono::Utc;
use overseer_core::{Error, Result, Task, TaskPatch, TaskState};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Key-addressable task store. Mutations serialize behind the writer lock and
/// rewrite `tasks.json` atomically; reads clone snapshots.
pub struct TaskStore {
    state: JsonState,
    tasks: RwLock<Vec<Task>>,
}

impl TaskStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let state = JsonState::new(path);
        let tasks: Vec<Task> = state.load_or_default();
        Self {
            state,
            tasks: RwLock::new(tasks),
        }
    }

    /// Restart recovery: any task left non-terminal is failed with
    /// "interrupted by restart" — unless its work still sits as a pending
    /// device task, in which case the task keeps waiting on the queue.
    pub async fn recover(&self, pending_device_parents: &HashSet<String>) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut recovered = 0;
        for task in tasks.iter_mut() {
            if matches!(task.status, TaskState::Running | TaskState::Pending) {
                if pending_device_parents.contains(&task.id) {
                    info!(task = %task.id, "task kept alive: device task still pending");
                    continue;
                }
                task.status = TaskState::Failed;
                task.failure_reason = Some(INTERRUPTED_REASON.to_string());
                task.completed_at = Some(Utc::now());
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(count = recovered, "tasks failed by restart recovery");
            self.persist(&tasks);
        }
        recovered
    }

    fn persist(&self, tasks: &[Task]) {
        if let Err(e) = self.state.save(&tasks.to_vec()) {
            warn!(error = %e, "failed to persist tasks");
        }
    }

    pub async fn create(&self, task: Task) -> Task {
        let mut tasks = self.tasks.write().await;
        tasks.push(task.clone());
        self.persist(&tasks);
        task
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.iter().find(|t| t.id == id).cloned()
    }

    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }

    pub async fn list_by_owner(&self, owner: &str) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect()
    }

    /// Mutate one task in place under the writer lock and persist.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::not_found("task", id))?;
        mutate(task);
        let updated = task.clone();
        self.persist(&tasks);
        Ok(updated)
    }

    /// Partial-merge update: only fields present in the patch change.
    pub async fn patch(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.update(id, |task| {
            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(briefing) = patch.briefing {
                task.briefing = briefing;
            }
            if let Some(role) = patch.role {
                task.role = Some(role);
            }
            if let Some(model) = patch.model {
                task.model = Some(model);
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(diff) = patch.diff {
                task.diff = Some(diff);
            }
            if let Some(reason) = patch.failure_reason {
                task.failure_reason = Some(reason);
            }
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let idx = tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| Error::not_found("task", id))?;
        let removed = tasks.remove(idx);
        self.persist(&tasks);
        Ok(removed)
    }

    /// Delete every task. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let count = tasks.len();
        tasks.clear();
        self.persist(&tasks);
        count
    }
}
