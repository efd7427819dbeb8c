//! Dependency-driven scheduling: the advance loop, gates, and artifact flow.
//!
//! The executor owns the task-to-node mapping table; task records carry no
//! back-references. Node starts are fire-and-forget — the runner's terminal
//! state routes back through the mapping and triggers the next advance.

use crate::store::DagStore;
use crate::types::{Dag, DagEdge, DagNode, DagState, GateCondition, NodeKind, NodeState};
use dashmap::DashMap;
use overseer_core::{ArtifactValue, Broadcaster, Error, Event, Result, Task, TaskState};
use overseer_runner::TaskRunner;
use overseer_store::{RoleRegistry, TaskStore};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const OUTPUT_SUMMARY_BYTES: usize = 4096;

pub struct DagExecutor {
    store: Arc<DagStore>,
    tasks: Arc<TaskStore>,
    runner: Arc<TaskRunner>,
    roles: Arc<RoleRegistry>,
    broadcaster: Arc<Broadcaster>,
    /// task ID → (dag ID, node ID); the only link between tasks and nodes.
    mapping: DashMap<String, (String, String)>,
    /// Serializes advances; keeps the ready-set computation race-free.
    advance_lock: Mutex<()>,
}

enum GateVerdict {
    Complete,
    Fail(String),
    WaitApproval,
    NotYet,
}

impl DagExecutor {
    pub fn new(
        store: Arc<DagStore>,
        tasks: Arc<TaskStore>,
        runner: Arc<TaskRunner>,
        roles: Arc<RoleRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            store,
            tasks,
            runner,
            roles,
            broadcaster,
            mapping: DashMap::new(),
            advance_lock: Mutex::new(()),
        }
    }

    /// Forward per-task output onto node-scoped events for observers that
    /// follow DAGs rather than tasks. Call once after wiring.
    pub fn attach_output_forwarding(self: &Arc<Self>) {
        let exec = Arc::clone(self);
        self.broadcaster
            .subscribe_fn("dag-output-forwarder", move |event| {
                if let Event::TaskOutput { task_id, line, .. } = event {
                    if let Some(entry) = exec.mapping.get(&task_id) {
                        let (dag_id, node_id) = entry.value().clone();
                        exec.broadcaster.broadcast(Event::DagNodeOutput {
                            dag_id,
                            node_id,
                            line,
                        });
                    }
                }
            });
    }

    pub async fn create(&self, dag: Dag) -> Result<Dag> {
        let dag = self.store.create(dag).await?;
        info!(dag = %dag.id, name = %dag.name, nodes = dag.nodes.len(), "dag created");
        self.broadcaster.broadcast(Event::DagCreated {
            dag_id: dag.id.clone(),
            name: dag.name.clone(),
            project: dag.project.clone(),
        });
        Ok(dag)
    }

    pub async fn get(&self, dag_id: &str) -> Result<Dag> {
        self.store.get(dag_id).await
    }

    pub async fn list(&self) -> Vec<Dag> {
        self.store.list().await
    }

    /// Move a DAG into `running` and kick the first advance.
    pub async fn execute(self: &Arc<Self>, dag_id: &str) -> Result<Dag> {
        self.store
            .update(dag_id, |dag| match dag.state {
                DagState::Created | DagState::Paused => {
                    dag.state = DagState::Running;
                    Ok(())
                }
                DagState::Running => Err(Error::conflict("dag already running")),
                other => Err(Error::conflict(format!("dag is {}", other))),
            })
            .await?;
        self.broadcaster.broadcast(Event::DagStarted {
            dag_id: dag_id.to_string(),
        });
        self.advance(dag_id).await?;
        self.store.get(dag_id).await
    }

    /// The idempotent scheduler step: evaluate gates and pass-through nodes,
    /// start every ready task node, recompute the overall status.
    pub fn advance<'a>(
        self: &'a Arc<Self>,
        dag_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.advance_lock.lock().await;

            let mut events: Vec<Event> = Vec::new();
            let mut to_start: Vec<DagNode> = Vec::new();
            let mut terminal: Option<DagState> = None;

            self.store
                .update(dag_id, |dag| {
                    if dag.state != DagState::Running {
                        return Ok(());
                    }
                    loop {
                        let mut changed = false;
                        changed |= Self::evaluate_gates(dag, &mut events);
                        changed |= Self::complete_fan_nodes(dag, &mut events);
                        changed |= Self::mark_ready_tasks(dag, &mut events, &mut to_start);
                        if !changed {
                            break;
                        }
                    }
                    let status = dag.compute_status();
                    if status != dag.state {
                        dag.state = status;
                        if matches!(status, DagState::Completed | DagState::Failed) {
                            terminal = Some(status);
                        }
                    }
                    Ok(())
                })
                .await?;

            for event in events {
                self.broadcaster.broadcast(event);
            }

            for node in to_start {
                self.start_task_node(dag_id, node).await?;
            }

            if let Some(status) = terminal {
                info!(dag = %dag_id, status = %status, "dag finished");
                self.broadcaster.broadcast(Event::DagCompleted {
                    dag_id: dag_id.to_string(),
                    status: status.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Gates inspect terminal predecessors — a failed predecessor must be
    /// able to fail an `all_pass` gate, so gate readiness is wider than the
    /// plain ready set.
    fn evaluate_gates(dag: &mut Dag, events: &mut Vec<Event>) -> bool {
        let gate_ids: Vec<String> = dag
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Gate && n.state == NodeState::Pending)
            .map(|n| n.id.clone())
            .collect();

        let mut changed = false;
        for id in gate_ids {
            let condition = dag
                .node(&id)
                .and_then(|n| n.gate_condition)
                .unwrap_or(GateCondition::AllPass);
            let preds = dag.predecessors(&id);
            let all_terminal = preds.iter().all(|p| p.state.is_terminal());
            let all_resolved = preds.iter().all(|p| p.state.is_resolved());
            let any_completed = preds.iter().any(|p| p.state == NodeState::Completed);

            let verdict = match condition {
                GateCondition::AllPass => {
                    if !all_terminal {
                        GateVerdict::NotYet
                    } else if all_resolved {
                        GateVerdict::Complete
                    } else {
                        GateVerdict::Fail("gate condition 'all_pass' not met".to_string())
                    }
                }
                GateCondition::AnyPass => {
                    if any_completed {
                        GateVerdict::Complete
                    } else if all_terminal {
                        GateVerdict::Fail("gate condition 'any_pass' not met".to_string())
                    } else {
                        GateVerdict::NotYet
                    }
                }
                GateCondition::Manual => {
                    if all_resolved {
                        GateVerdict::WaitApproval
                    } else {
                        GateVerdict::NotYet
                    }
                }
            };

            let node = dag.node_mut(&id).expect("gate id from iteration");
            match verdict {
                GateVerdict::Complete => {
                    node.state = NodeState::Completed;
                    events.push(Event::DagNodeCompleted {
                        dag_id: dag.id.clone(),
                        node_id: id,
                        status: NodeState::Completed.to_string(),
                        artifacts: Value::Object(Default::default()),
                    });
                    changed = true;
                }
                GateVerdict::Fail(reason) => {
                    node.state = NodeState::Failed;
                    node.failure_reason = Some(reason.clone());
                    events.push(Event::DagNodeFailed {
                        dag_id: dag.id.clone(),
                        node_id: id,
                        reason,
                    });
                    changed = true;
                }
                GateVerdict::WaitApproval => {
                    node.state = NodeState::WaitingApproval;
                    events.push(Event::DagNodeWaitingApproval {
                        dag_id: dag.id.clone(),
                        node_id: id,
                    });
                    changed = true;
                }
                GateVerdict::NotYet => {}
            }
        }
        changed
    }

    /// Fan-out/fan-in nodes are structural: they resolve the moment their
    /// predecessors do.
    fn complete_fan_nodes(dag: &mut Dag, events: &mut Vec<Event>) -> bool {
        let ready: Vec<String> = dag
            .ready_node_ids()
            .into_iter()
            .filter(|id| {
                matches!(
                    dag.node(id).map(|n| n.kind),
                    Some(NodeKind::FanOut) | Some(NodeKind::FanIn)
                )
            })
            .collect();

        let mut changed = false;
        for id in ready {
            let node = dag.node_mut(&id).expect("node id from ready set");
            node.state = NodeState::Completed;
            events.push(Event::DagNodeCompleted {
                dag_id: dag.id.clone(),
                node_id: id,
                status: NodeState::Completed.to_string(),
                artifacts: Value::Object(Default::default()),
            });
            changed = true;
        }
        changed
    }

    fn mark_ready_tasks(
        dag: &mut Dag,
        events: &mut Vec<Event>,
        to_start: &mut Vec<DagNode>,
    ) -> bool {
        let dag_id = dag.id.clone();
        let ready: Vec<String> = dag
            .ready_node_ids()
            .into_iter()
            .filter(|id| dag.node(id).map(|n| n.kind) == Some(NodeKind::Task))
            .collect();

        let mut changed = false;
        for id in ready {
            let upstream = Self::collect_upstream(dag, &id);
            let node = dag.node_mut(&id).expect("node id from ready set");
            if let Some(upstream) = upstream {
                node.briefing.push_str(&format!(
                    "\n\n## Upstream Artifacts\n\n```json\n{}\n```",
                    serde_json::to_string_pretty(&upstream).unwrap_or_default()
                ));
            }
            node.state = NodeState::Running;
            events.push(Event::DagNodeStarted {
                dag_id: dag_id.clone(),
                node_id: node.id.clone(),
                title: node.title.clone(),
            });
            to_start.push(node.clone());
            changed = true;
        }
        changed
    }

    /// `{pred_id: {title, role, ...artifacts}}` for completed predecessors.
    fn collect_upstream(dag: &Dag, node_id: &str) -> Option<Value> {
        let mut map = serde_json::Map::new();
        for pred in dag.predecessors(node_id) {
            if pred.state != NodeState::Completed || pred.artifacts.is_empty() {
                continue;
            }
            let mut entry = serde_json::Map::new();
            entry.insert("title".to_string(), Value::String(pred.title.clone()));
            entry.insert(
                "role".to_string(),
                pred.role
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            for (key, value) in &pred.artifacts {
                entry.insert(key.clone(), value.to_json());
            }
            map.insert(pred.id.clone(), Value::Object(entry));
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    /// Create the backing task, record the mapping, and fire the runner.
    async fn start_task_node(self: &Arc<Self>, dag_id: &str, node: DagNode) -> Result<()> {
        let dag = self.store.get(dag_id).await?;
        let role = node.role.as_deref().and_then(|id| self.roles.get(id));

        let mut task = Task::new(
            format!("dag:{}", dag_id),
            dag.project.clone(),
            node.title.clone(),
            node.briefing.clone(),
        );
        task.agent = node.agent;
        task.role = node.role.clone();
        task.scope = if node.scope.is_empty() {
            role.map(|r| r.scope.clone()).unwrap_or_default()
        } else {
            node.scope.clone()
        };
        let task = self.tasks.create(task).await;

        self.store
            .update(dag_id, |dag| {
                if let Some(n) = dag.node_mut(&node.id) {
                    n.task_id = Some(task.id.clone());
                }
                Ok(())
            })
            .await?;
        self.mapping
            .insert(task.id.clone(), (dag_id.to_string(), node.id.clone()));
        debug!(dag = %dag_id, node = %node.id, task = %task.id, "node dispatched");

        let exec = Arc::clone(self);
        let runner = Arc::clone(&self.runner);
        let task_id = task.id.clone();
        let device = node.device_id.clone();
        tokio::spawn(async move {
            let state = runner.run(&task_id, device).await;
            exec.on_task_terminal(&task_id, state).await;
        });
        Ok(())
    }

    /// Route a task's terminal state back onto its node: mirror status,
    /// capture output, extract artifacts, drop the mapping, re-advance.
    pub async fn on_task_terminal(self: &Arc<Self>, task_id: &str, state: TaskState) {
        let Some((_, (dag_id, node_id))) = self.mapping.remove(task_id) else {
            debug!(task = %task_id, "terminal task has no node mapping");
            return;
        };

        let task = self.tasks.get(task_id).await;
        let output_text = task
            .as_ref()
            .map(|t| {
                t.output
                    .iter()
                    .map(|l| l.line.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let failure_reason = task
            .as_ref()
            .and_then(|t| t.failure_reason.clone())
            .unwrap_or_else(|| "task failed".to_string());

        let structured = extract_structured(&output_text);
        let summary = truncate_bytes(&output_text, OUTPUT_SUMMARY_BYTES);
        let node_state = if state == TaskState::Completed {
            NodeState::Completed
        } else {
            NodeState::Failed
        };

        let routed = self
            .store
            .update(&dag_id, |dag| {
                let node = dag
                    .node_mut(&node_id)
                    .ok_or_else(|| Error::not_found("dag node", node_id.clone()))?;
                if node.state.is_terminal() {
                    return Ok(None);
                }
                node.output = Some(output_text.clone());
                node.artifacts.insert(
                    "output_summary".to_string(),
                    ArtifactValue::text(summary.clone()),
                );
                if let Some(value) = &structured {
                    node.artifacts.insert(
                        "structured".to_string(),
                        ArtifactValue::from_json(value.clone()),
                    );
                }
                node.state = node_state;
                if node_state == NodeState::Failed {
                    node.failure_reason = Some(failure_reason.clone());
                }
                let artifacts: Value = Value::Object(
                    node.artifacts
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect(),
                );
                Ok(Some(artifacts))
            })
            .await;

        match routed {
            Ok(Some(artifacts)) => {
                if node_state == NodeState::Completed {
                    self.broadcaster.broadcast(Event::DagNodeCompleted {
                        dag_id: dag_id.clone(),
                        node_id: node_id.clone(),
                        status: node_state.to_string(),
                        artifacts,
                    });
                } else {
                    self.broadcaster.broadcast(Event::DagNodeFailed {
                        dag_id: dag_id.clone(),
                        node_id: node_id.clone(),
                        reason: failure_reason.clone(),
                    });
                }
            }
            Ok(None) => debug!(dag = %dag_id, node = %node_id, "node already terminal"),
            Err(e) => warn!(dag = %dag_id, node = %node_id, error = %e, "terminal routing failed"),
        }

        if let Err(e) = self.advance(&dag_id).await {
            warn!(dag = %dag_id, error = %e, "advance after terminal failed");
        }
    }

    /// External approval flips a waiting manual gate to completed.
    pub async fn approve_node(self: &Arc<Self>, dag_id: &str, node_id: &str) -> Result<()> {
        self.store
            .update(dag_id, |dag| {
                let node = dag
                    .node_mut(node_id)
                    .ok_or_else(|| Error::not_found("dag node", node_id))?;
                if node.state != NodeState::WaitingApproval {
                    return Err(Error::conflict(format!(
                        "node {} is not waiting for approval",
                        node_id
                    )));
                }
                node.state = NodeState::Completed;
                Ok(())
            })
            .await?;
        info!(dag = %dag_id, node = %node_id, "gate approved");
        self.broadcaster.broadcast(Event::DagNodeCompleted {
            dag_id: dag_id.to_string(),
            node_id: node_id.to_string(),
            status: NodeState::Completed.to_string(),
            artifacts: Value::Object(Default::default()),
        });
        self.advance(dag_id).await
    }

    /// Dynamic insertion into a live DAG: the node plus incident edges must
    /// keep the graph valid, then an advance picks it up if ready.
    pub async fn insert_node(
        self: &Arc<Self>,
        dag_id: &str,
        mut node: DagNode,
        edges: Vec<DagEdge>,
    ) -> Result<Dag> {
        node.state = NodeState::Pending;
        let node_id = node.id.clone();
        self.store
            .update(dag_id, |dag| {
                if matches!(dag.state, DagState::Completed | DagState::Failed) {
                    return Err(Error::conflict("dag already finished"));
                }
                let mut candidate = dag.clone();
                candidate.nodes.push(node.clone());
                candidate.edges.extend(edges.clone());
                candidate.validate()?;
                *dag = candidate;
                Ok(())
            })
            .await?;
        self.broadcaster.broadcast(Event::DagNodeAdded {
            dag_id: dag_id.to_string(),
            node_id,
        });
        self.advance(dag_id).await?;
        self.store.get(dag_id).await
    }

    /// Delete a non-running DAG and unlink its mappings. Tasks it spawned
    /// are not retroactively purged.
    pub async fn delete(&self, dag_id: &str) -> Result<Dag> {
        let removed = self.store.delete(dag_id).await?;
        self.mapping.retain(|_, mapped| mapped.0 != dag_id);
        Ok(removed)
    }

    pub fn mapping_for_task(&self, task_id: &str) -> Option<(String, String)> {
        self.mapping.get(task_id).map(|e| e.value().clone())
    }
}

/// The last fenced ```json block in the output, when it parses.
fn extract_structured(output: &str) -> Option<Value> {
    let start = output.rfind("```json")?;
    let body = &output[start + "```json".len()..];
    let body = body.strip_prefix('\n').unwrap_or(body);
    let doc = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    serde_json::from_str(doc.trim()).ok()
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::AgentKind;
    use overseer_devices::DeviceTaskQueue;
    use overseer_knowledge::KnowledgeQuery;
    use overseer_runner::RunnerConfig;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<DagStore>,
        tasks: Arc<TaskStore>,
        executor: Arc<DagExecutor>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let broadcaster = Arc::new(Broadcaster::new());
        let tasks = Arc::new(TaskStore::load(dir.path().join("tasks.json")));
        let queue = Arc::new(DeviceTaskQueue::load(
            dir.path().join("device-tasks.json"),
            Arc::clone(&broadcaster),
        ));
        let roles = Arc::new(RoleRegistry::builtin());
        let config = RunnerConfig {
            claude_command: String::new(),
            augment_command: "false".to_string(),
            use_pty_wrap: false,
            ..RunnerConfig::default()
        };
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&tasks),
            Arc::clone(&roles),
            KnowledgeQuery::disconnected(),
            queue,
            Arc::clone(&broadcaster),
            config,
        ));
        let store = Arc::new(DagStore::load(dir.path().join("dags.json")));
        let executor = Arc::new(DagExecutor::new(
            Arc::clone(&store),
            Arc::clone(&tasks),
            runner,
            roles,
            broadcaster,
        ));
        executor.attach_output_forwarding();
        Harness {
            _dir: dir,
            store,
            tasks,
            executor,
        }
    }

    async fn wait_until(
        store: &DagStore,
        dag_id: &str,
        what: &str,
        pred: impl Fn(&Dag) -> bool,
    ) -> Dag {
        for _ in 0..200 {
            let dag = store.get(dag_id).await.unwrap();
            if pred(&dag) {
                return dag;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "condition '{}' not reached: {:?}",
            what,
            store.get(dag_id).await.unwrap()
        );
    }

    fn failing_node(id: &str, title: &str) -> DagNode {
        // The harness maps augment to `false`, which exits 1.
        let mut node = DagNode::task(id, title, "irrelevant");
        node.agent = AgentKind::LocalAugment;
        node
    }

    #[tokio::test]
    async fn linear_chain_runs_to_completion() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "chain",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("a", "A", "first step"),
                    DagNode::task("b", "B", "second step"),
                    DagNode::task("c", "C", "third step"),
                ],
                vec![DagEdge::new("a", "b"), DagEdge::new("b", "c")],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        let done = wait_until(&h.store, &dag.id, "dag completed", |d| {
            d.state == DagState::Completed
        })
        .await;

        for id in ["a", "b", "c"] {
            let node = done.node(id).unwrap();
            assert_eq!(node.state, NodeState::Completed);
            assert!(node.task_id.is_some(), "node {} missing linked task", id);
            assert!(node.artifacts.contains_key("output_summary"));
        }
    }

    #[tokio::test]
    async fn zero_edges_all_nodes_start_immediately() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "parallel",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("x", "X", "one"),
                    DagNode::task("y", "Y", "two"),
                ],
                vec![],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        let done = wait_until(&h.store, &dag.id, "dag completed", |d| {
            d.state == DagState::Completed
        })
        .await;
        assert!(done.nodes.iter().all(|n| n.state == NodeState::Completed));
    }

    #[tokio::test]
    async fn artifacts_propagate_downstream() {
        let h = harness();
        // The echo agent prints its briefing, so A's output carries the block.
        let a_brief = "Produce the contract.\n```json\n{\"api\": \"v1\"}\n```";
        let dag = h
            .executor
            .create(Dag::new(
                "artifacts",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("a", "Design API", a_brief),
                    DagNode::task("b", "Implement API", "implement it"),
                ],
                vec![DagEdge::new("a", "b")],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        let done = wait_until(&h.store, &dag.id, "dag completed", |d| {
            d.state == DagState::Completed
        })
        .await;

        let a = done.node("a").unwrap();
        assert_eq!(
            a.artifacts.get("structured").map(|v| v.to_json()),
            Some(serde_json::json!({"api": "v1"}))
        );

        // B's briefing gained the upstream block keyed by A's node ID.
        let b = done.node("b").unwrap();
        let b_task = h.tasks.get(b.task_id.as_deref().unwrap()).await.unwrap();
        assert!(b_task.briefing.contains("## Upstream Artifacts"));
        assert!(b_task.briefing.contains("\"a\""));
        assert!(b_task.briefing.contains("\"api\""));
        assert!(b_task.briefing.contains("Design API"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_pass_gate_fails_when_a_predecessor_fails() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "gated",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("p1", "P1", "fine"),
                    failing_node("p2", "P2"),
                    DagNode::gate("g", "Gate", GateCondition::AllPass),
                    DagNode::task("d", "Downstream", "never runs"),
                ],
                vec![
                    DagEdge::new("p1", "g"),
                    DagEdge::new("p2", "g"),
                    DagEdge::new("g", "d"),
                ],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        let done = wait_until(&h.store, &dag.id, "dag failed", |d| {
            d.state == DagState::Failed
        })
        .await;

        let gate = done.node("g").unwrap();
        assert_eq!(gate.state, NodeState::Failed);
        assert_eq!(
            gate.failure_reason.as_deref(),
            Some("gate condition 'all_pass' not met")
        );
        assert_eq!(done.node("d").unwrap().state, NodeState::Pending);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn any_pass_gate_passes_on_partial_success() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "any-pass",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("p1", "P1", "fine"),
                    failing_node("p2", "P2"),
                    DagNode::gate("g", "Gate", GateCondition::AnyPass),
                    DagNode::task("d", "Downstream", "runs anyway"),
                ],
                vec![
                    DagEdge::new("p1", "g"),
                    DagEdge::new("p2", "g"),
                    DagEdge::new("g", "d"),
                ],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        // The downstream completes through the gate; the failed node still
        // denies the DAG a completed status.
        let done = wait_until(&h.store, &dag.id, "downstream completed", |d| {
            d.node("d").map(|n| n.state) == Some(NodeState::Completed)
                && d.state != DagState::Running
        })
        .await;
        assert_eq!(done.node("g").unwrap().state, NodeState::Completed);
        assert_eq!(done.state, DagState::Failed);
    }

    #[tokio::test]
    async fn manual_gate_waits_for_approval() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "manual",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("a", "A", "before"),
                    DagNode::gate("g", "Review", GateCondition::Manual),
                    DagNode::task("b", "B", "after"),
                ],
                vec![DagEdge::new("a", "g"), DagEdge::new("g", "b")],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        let waiting = wait_until(&h.store, &dag.id, "gate waiting", |d| {
            d.node("g").map(|n| n.state) == Some(NodeState::WaitingApproval)
        })
        .await;
        assert_eq!(waiting.state, DagState::Running);
        assert_eq!(waiting.node("b").unwrap().state, NodeState::Pending);

        h.executor.approve_node(&dag.id, "g").await.unwrap();
        let done = wait_until(&h.store, &dag.id, "dag completed", |d| {
            d.state == DagState::Completed
        })
        .await;
        assert_eq!(done.node("b").unwrap().state, NodeState::Completed);
    }

    #[tokio::test]
    async fn approve_of_non_waiting_node_is_conflict() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "plain",
                "proj",
                crate::types::DagCreator::Manual,
                vec![DagNode::task("a", "A", "b")],
                vec![],
            ))
            .await
            .unwrap();
        let err = h.executor.approve_node(&dag.id, "a").await.unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn dynamic_insertion_into_running_dag() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "dynamic",
                "proj",
                crate::types::DagCreator::Manual,
                vec![
                    DagNode::task("a", "A", "before"),
                    DagNode::gate("hold", "Hold", GateCondition::Manual),
                ],
                vec![DagEdge::new("a", "hold")],
            ))
            .await
            .unwrap();

        h.executor.execute(&dag.id).await.unwrap();
        wait_until(&h.store, &dag.id, "gate waiting", |d| {
            d.node("hold").map(|n| n.state) == Some(NodeState::WaitingApproval)
        })
        .await;

        // A cycle-producing insertion is rejected.
        let err = h
            .executor
            .insert_node(
                &dag.id,
                DagNode::task("bad", "Bad", ""),
                vec![DagEdge::new("hold", "bad"), DagEdge::new("bad", "a")],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Validation);

        // A valid one lands and runs once the gate opens.
        h.executor
            .insert_node(
                &dag.id,
                DagNode::task("extra", "Extra", "late arrival"),
                vec![DagEdge::new("hold", "extra")],
            )
            .await
            .unwrap();

        h.executor.approve_node(&dag.id, "hold").await.unwrap();
        let done = wait_until(&h.store, &dag.id, "dag completed", |d| {
            d.state == DagState::Completed
        })
        .await;
        assert_eq!(done.node("extra").unwrap().state, NodeState::Completed);
    }

    #[tokio::test]
    async fn duplicate_insertion_id_rejected() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "dup",
                "proj",
                crate::types::DagCreator::Manual,
                vec![DagNode::gate("hold", "Hold", GateCondition::Manual)],
                vec![],
            ))
            .await
            .unwrap();
        h.executor.execute(&dag.id).await.unwrap();
        let err = h
            .executor
            .insert_node(&dag.id, DagNode::task("hold", "Clash", ""), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn delete_running_dag_forbidden() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "held",
                "proj",
                crate::types::DagCreator::Manual,
                vec![DagNode::gate("hold", "Hold", GateCondition::Manual)],
                vec![],
            ))
            .await
            .unwrap();
        h.executor.execute(&dag.id).await.unwrap();
        let err = h.executor.delete(&dag.id).await.unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn double_execute_is_conflict() {
        let h = harness();
        let dag = h
            .executor
            .create(Dag::new(
                "once",
                "proj",
                crate::types::DagCreator::Manual,
                vec![DagNode::gate("hold", "Hold", GateCondition::Manual)],
                vec![],
            ))
            .await
            .unwrap();
        h.executor.execute(&dag.id).await.unwrap();
        let err = h.executor.execute(&dag.id).await.unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Conflict);
    }

    #[test]
    fn structured_extraction_takes_last_block() {
        let output = "quoted upstream:\n```json\n{\"old\": 1}\n```\nmy result:\n```json\n{\"new\": 2}\n```";
        assert_eq!(
            extract_structured(output),
            Some(serde_json::json!({"new": 2}))
        );
        assert_eq!(extract_structured("no blocks here"), None);
        assert_eq!(extract_structured("```json\nnot json\n```"), None);
    }
}
