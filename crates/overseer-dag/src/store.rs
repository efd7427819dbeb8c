//! Durable DAG records with creation validation and restart recovery

use crate::types::{Dag, DagState, NodeState};
use overseer_core::{Error, Result};
use overseer_store::JsonState;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

pub const INTERRUPTED_REASON: &str = "interrupted by restart";

pub struct DagStore {
    state: JsonState,
    dags: RwLock<Vec<Dag>>,
}

impl DagStore {
    /// Load `dags.json`. Any node caught `running` by a crash is failed with
    /// "interrupted by restart" and its DAG's status recomputed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let state = JsonState::new(path);
        let mut dags: Vec<Dag> = state.load_or_default();

        let mut recovered = 0;
        for dag in dags.iter_mut() {
            if dag.state != DagState::Running {
                continue;
            }
            for node in dag.nodes.iter_mut() {
                if node.state == NodeState::Running {
                    node.state = NodeState::Failed;
                    node.failure_reason = Some(INTERRUPTED_REASON.to_string());
                    recovered += 1;
                }
            }
            dag.state = dag.compute_status();
        }
        if recovered > 0 {
            warn!(count = recovered, "dag nodes failed by restart recovery");
            if let Err(e) = state.save(&dags) {
                warn!(error = %e, "failed to persist dags");
            }
        }

        Self {
            state,
            dags: RwLock::new(dags),
        }
    }

    fn persist(&self, dags: &[Dag]) {
        if let Err(e) = self.state.save(&dags.to_vec()) {
            warn!(error = %e, "failed to persist dags");
        }
    }

    /// Validate and insert a new DAG.
    pub async fn create(&self, dag: Dag) -> Result<Dag> {
        dag.validate()?;
        let mut dags = self.dags.write().await;
        dags.push(dag.clone());
        self.persist(&dags);
        Ok(dag)
    }

    pub async fn get(&self, id: &str) -> Result<Dag> {
        self.dags
            .read()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("dag", id))
    }

    pub async fn list(&self) -> Vec<Dag> {
        self.dags.read().await.clone()
    }

    /// Apply a fallible mutation under the writer lock, then persist.
    pub async fn update<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Dag) -> Result<R>,
    ) -> Result<R> {
        let mut dags = self.dags.write().await;
        let dag = dags
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::not_found("dag", id))?;
        let result = mutate(dag)?;
        self.persist(&dags);
        Ok(result)
    }

    /// Deleting a running DAG is forbidden.
    pub async fn delete(&self, id: &str) -> Result<Dag> {
        let mut dags = self.dags.write().await;
        let idx = dags
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::not_found("dag", id))?;
        if dags[idx].state == DagState::Running {
            return Err(Error::conflict("cannot delete a running dag"));
        }
        let removed = dags.remove(idx);
        self.persist(&dags);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DagCreator, DagEdge, DagNode};

    fn sample() -> Dag {
        Dag::new(
            "sample",
            "proj",
            DagCreator::Manual,
            vec![DagNode::task("a", "A", ""), DagNode::task("b", "B", "")],
            vec![DagEdge::new("a", "b")],
        )
    }

    #[tokio::test]
    async fn create_validates() {
        let dir = tempfile::tempdir().unwrap();
        let store = DagStore::load(dir.path().join("dags.json"));
        assert!(store.create(sample()).await.is_ok());

        let cyclic = Dag::new(
            "bad",
            "p",
            DagCreator::Manual,
            vec![DagNode::task("x", "X", ""), DagNode::task("y", "Y", "")],
            vec![DagEdge::new("x", "y"), DagEdge::new("y", "x")],
        );
        assert!(store.create(cyclic).await.is_err());
    }

    #[tokio::test]
    async fn delete_running_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = DagStore::load(dir.path().join("dags.json"));
        let dag = store.create(sample()).await.unwrap();
        store
            .update(&dag.id, |d| {
                d.state = DagState::Running;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.delete(&dag.id).await.unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Conflict);

        store
            .update(&dag.id, |d| {
                d.state = DagState::Completed;
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.delete(&dag.id).await.is_ok());
    }

    #[tokio::test]
    async fn restart_recovery_fails_running_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dags.json");
        let dag_id = {
            let store = DagStore::load(&path);
            let dag = store.create(sample()).await.unwrap();
            store
                .update(&dag.id, |d| {
                    d.state = DagState::Running;
                    d.node_mut("a").unwrap().state = NodeState::Running;
                    Ok(())
                })
                .await
                .unwrap();
            dag.id
        };

        let store = DagStore::load(&path);
        let dag = store.get(&dag_id).await.unwrap();
        let node = dag.node("a").unwrap();
        assert_eq!(node.state, NodeState::Failed);
        assert_eq!(node.failure_reason.as_deref(), Some(INTERRUPTED_REASON));
        // b is pending behind a failure; nothing can progress.
        assert_eq!(dag.state, DagState::Failed);
    }

    #[tokio::test]
    async fn failed_update_does_not_persist_partial() {
        let dir = tempfile::tempdir().unwrap();
        let store = DagStore::load(dir.path().join("dags.json"));
        let dag = store.create(sample()).await.unwrap();
        let err = store
            .update::<()>(&dag.id, |_| Err(Error::validation("nope")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Validation);
    }
}
