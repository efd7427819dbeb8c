//! Pending-task inbox per device with polling pickup and completion gates

use crate::types::{DeviceTask, DeviceTaskState};
use chrono::Utc;
use dashmap::DashMap;
use overseer_core::{Broadcaster, Error, Event, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// How long a dispatched task waits for its device before failing.
pub const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const WAIT_TIMEOUT_REASON: &str = "timeout waiting for device";
pub const DEVICE_GONE_REASON: &str = "device gone";

pub struct DeviceTaskQueue {
    state: overseer_store::JsonState,
    tasks: RwLock<Vec<DeviceTask>>,
    /// Per-device-task completion gates; waiters park here until a terminal
    /// transition notifies them.
    gates: DashMap<String, Arc<Notify>>,
    broadcaster: Arc<Broadcaster>,
}

impl DeviceTaskQueue {
    /// Load the queue. Completed and failed tasks are pruned; a task caught
    /// `running` by a crash is reset to `pending` so its device re-picks it.
    pub fn load(path: impl Into<PathBuf>, broadcaster: Arc<Broadcaster>) -> Self {
        let state = overseer_store::JsonState::new(path);
        let mut tasks: Vec<DeviceTask> = state.load_or_default();

        tasks.retain(|t| !t.state.is_terminal());
        let mut reset = 0;
        for task in tasks.iter_mut() {
            if task.state == DeviceTaskState::Running {
                task.state = DeviceTaskState::Pending;
                task.picked_at = None;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(count = reset, "device tasks reset to pending after restart");
        }
        if let Err(e) = state.save(&tasks) {
            warn!(error = %e, "failed to persist device tasks");
        }

        Self {
            state,
            tasks: RwLock::new(tasks),
            gates: DashMap::new(),
            broadcaster,
        }
    }

    fn persist(&self, tasks: &[DeviceTask]) {
        if let Err(e) = self.state.save(&tasks.to_vec()) {
            warn!(error = %e, "failed to persist device tasks");
        }
    }

    fn gate(&self, dt_id: &str) -> Arc<Notify> {
        self.gates
            .entry(dt_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Parent-task IDs with work still pending here. The task store consults
    /// this during restart recovery to keep those parents alive.
    pub async fn pending_parent_ids(&self) -> HashSet<String> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.state == DeviceTaskState::Pending)
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub async fn enqueue(
        &self,
        task_id: &str,
        device_id: &str,
        model: &str,
        prompt: &str,
    ) -> DeviceTask {
        let task = DeviceTask {
            id: format!("dt-{}", overseer_core::new_id()),
            task_id: task_id.to_string(),
            device_id: device_id.to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            state: DeviceTaskState::Pending,
            picked_at: None,
            completed_at: None,
            output: String::new(),
            error: None,
            created_at: Utc::now(),
        };
        let mut tasks = self.tasks.write().await;
        tasks.push(task.clone());
        self.persist(&tasks);
        debug!(device_task = %task.id, device = %device_id, "device task enqueued");
        task
    }

    pub async fn get(&self, dt_id: &str) -> Result<DeviceTask> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == dt_id)
            .cloned()
            .ok_or_else(|| Error::not_found("device task", dt_id))
    }

    /// Poll surface: pending tasks targeted at one device.
    pub async fn pending_for_device(&self, device_id: &str) -> Vec<DeviceTask> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.device_id == device_id && t.state == DeviceTaskState::Pending)
            .cloned()
            .collect()
    }

    /// Device claims a task. Only a pending task can be picked; anything else
    /// reads as not-found so a stale poll cannot double-claim.
    pub async fn pick(&self, dt_id: &str) -> Result<DeviceTask> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == dt_id && t.state == DeviceTaskState::Pending)
            .ok_or_else(|| Error::not_found("pending device task", dt_id))?;
        task.state = DeviceTaskState::Running;
        task.picked_at = Some(Utc::now());
        let picked = task.clone();
        self.persist(&tasks);
        debug!(device_task = %dt_id, "device task picked");
        Ok(picked)
    }

    /// Append an output chunk from the device.
    pub async fn append_chunk(&self, dt_id: &str, chunk: &str) -> Result<()> {
        let task_id = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == dt_id)
                .ok_or_else(|| Error::not_found("device task", dt_id))?;
            task.output.push_str(chunk);
            let task_id = task.task_id.clone();
            self.persist(&tasks);
            task_id
        };
        self.broadcaster.broadcast(Event::TaskChunk {
            device_task_id: dt_id.to_string(),
            task_id,
            chunk: chunk.to_string(),
        });
        Ok(())
    }

    /// Terminal transition. A second completion of a terminal task is a no-op
    /// returning the settled record — devices may re-report after a restart.
    pub async fn complete(&self, dt_id: &str, output: Option<String>) -> Result<DeviceTask> {
        self.finish(dt_id, DeviceTaskState::Completed, output, None).await
    }

    pub async fn fail(&self, dt_id: &str, error: &str) -> Result<DeviceTask> {
        self.finish(dt_id, DeviceTaskState::Failed, None, Some(error.to_string()))
            .await
    }

    async fn finish(
        &self,
        dt_id: &str,
        state: DeviceTaskState,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<DeviceTask> {
        let settled = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == dt_id)
                .ok_or_else(|| Error::not_found("device task", dt_id))?;

            if task.state.is_terminal() {
                debug!(device_task = %dt_id, "duplicate terminal report ignored");
                return Ok(task.clone());
            }

            task.state = state;
            task.completed_at = Some(Utc::now());
            if let Some(out) = output {
                task.output.push_str(&out);
            }
            task.error = error;
            let settled = task.clone();
            self.persist(&tasks);
            settled
        };

        if let Some((_, gate)) = self.gates.remove(dt_id) {
            gate.notify_waiters();
        }
        debug!(device_task = %dt_id, state = ?settled.state, "device task settled");
        Ok(settled)
    }

    /// Block until the device task reaches a terminal state. On timeout the
    /// task is failed with "timeout waiting for device" and the wait errors.
    pub async fn wait_for_completion(&self, dt_id: &str, max_wait: Duration) -> Result<DeviceTask> {
        let gate = self.gate(dt_id);
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let notified = gate.notified();
            let current = self.get(dt_id).await?;
            if current.state.is_terminal() {
                self.gates.remove(dt_id);
                return Ok(current);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(device_task = %dt_id, "device wait timed out");
                self.fail(dt_id, WAIT_TIMEOUT_REASON).await?;
                self.gates.remove(dt_id);
                return Err(Error::timeout(WAIT_TIMEOUT_REASON));
            }
        }
    }

    /// Fail every non-terminal task bound to a deleted device, waking waiters.
    pub async fn abandon_device(&self, device_id: &str) -> Vec<DeviceTask> {
        let ids: Vec<String> = {
            let tasks = self.tasks.read().await;
            tasks
                .iter()
                .filter(|t| t.device_id == device_id && !t.state.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };
        let mut failed = Vec::new();
        for id in ids {
            if let Ok(task) = self.fail(&id, DEVICE_GONE_REASON).await {
                failed.push(task);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(dir: &tempfile::TempDir) -> Arc<DeviceTaskQueue> {
        Arc::new(DeviceTaskQueue::load(
            dir.path().join("device-tasks.json"),
            Arc::new(Broadcaster::new()),
        ))
    }

    #[tokio::test]
    async fn enqueue_poll_pick_flow() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let dt = q.enqueue("task-1", "dev-1", "model-x", "do the thing").await;

        let pending = q.pending_for_device("dev-1").await;
        assert_eq!(pending.len(), 1);
        assert!(q.pending_for_device("dev-2").await.is_empty());

        let picked = q.pick(&dt.id).await.unwrap();
        assert_eq!(picked.state, DeviceTaskState::Running);
        assert!(picked.picked_at.is_some());

        // Picked task no longer polls as pending, and re-pick reads not-found.
        assert!(q.pending_for_device("dev-1").await.is_empty());
        let err = q.pick(&dt.id).await.unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn chunks_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let dt = q.enqueue("task-1", "dev-1", "m", "p").await;
        q.pick(&dt.id).await.unwrap();
        q.append_chunk(&dt.id, "hello ").await.unwrap();
        q.append_chunk(&dt.id, "world").await.unwrap();
        assert_eq!(q.get(&dt.id).await.unwrap().output, "hello world");
    }

    #[tokio::test]
    async fn wait_resolves_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let dt = q.enqueue("task-1", "dev-1", "m", "p").await;
        q.pick(&dt.id).await.unwrap();

        let waiter = {
            let q = Arc::clone(&q);
            let id = dt.id.clone();
            tokio::spawn(async move { q.wait_for_completion(&id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.complete(&dt.id, Some("done".into())).await.unwrap();

        let settled = waiter.await.unwrap().unwrap();
        assert_eq!(settled.state, DeviceTaskState::Completed);
        assert_eq!(settled.output, "done");
    }

    #[tokio::test]
    async fn wait_times_out_and_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let dt = q.enqueue("task-1", "dev-1", "m", "p").await;

        let err = q
            .wait_for_completion(&dt.id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Timeout);

        let task = q.get(&dt.id).await.unwrap();
        assert_eq!(task.state, DeviceTaskState::Failed);
        assert_eq!(task.error.as_deref(), Some(WAIT_TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn duplicate_completion_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let dt = q.enqueue("task-1", "dev-1", "m", "p").await;
        q.pick(&dt.id).await.unwrap();

        let first = q.complete(&dt.id, Some("result".into())).await.unwrap();
        assert_eq!(first.state, DeviceTaskState::Completed);

        // Device re-reports after a restart: state and output unchanged.
        let second = q.fail(&dt.id, "late failure").await.unwrap();
        assert_eq!(second.state, DeviceTaskState::Completed);
        assert_eq!(second.output, "result");
        assert!(second.error.is_none());
    }

    #[tokio::test]
    async fn restart_resets_running_and_prunes_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (running_id, completed_id) = {
            let q = queue(&dir);
            let running = q.enqueue("task-1", "dev-1", "m", "p").await;
            q.pick(&running.id).await.unwrap();
            let completed = q.enqueue("task-2", "dev-1", "m", "p").await;
            q.pick(&completed.id).await.unwrap();
            q.complete(&completed.id, None).await.unwrap();
            (running.id, completed.id)
        };

        let q = queue(&dir);
        let reloaded = q.get(&running_id).await.unwrap();
        assert_eq!(reloaded.state, DeviceTaskState::Pending);
        assert!(reloaded.picked_at.is_none());
        assert!(q.get(&completed_id).await.is_err());

        let parents = q.pending_parent_ids().await;
        assert!(parents.contains("task-1"));
        assert!(!parents.contains("task-2"));
    }

    #[tokio::test]
    async fn abandon_device_fails_in_flight_and_wakes_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir);
        let dt = q.enqueue("task-1", "dev-1", "m", "p").await;
        q.pick(&dt.id).await.unwrap();

        let waiter = {
            let q = Arc::clone(&q);
            let id = dt.id.clone();
            tokio::spawn(async move { q.wait_for_completion(&id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let failed = q.abandon_device("dev-1").await;
        assert_eq!(failed.len(), 1);

        let settled = waiter.await.unwrap().unwrap();
        assert_eq!(settled.state, DeviceTaskState::Failed);
        assert_eq!(settled.error.as_deref(), Some(DEVICE_GONE_REASON));
    }
}
