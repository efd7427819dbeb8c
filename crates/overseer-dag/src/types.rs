//! DAG records and the graph queries the executor relies on

use chrono::{DateTime, Utc};
use overseer_core::{AgentKind, ArtifactValue, Error, FileScope, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Gate,
    FanOut,
    FanIn,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateCondition {
    AllPass,
    AnyPass,
    Manual,
}

impl std::fmt::Display for GateCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AllPass => "all_pass",
            Self::AnyPass => "any_pass",
            Self::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    WaitingApproval,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// A resolved predecessor lets its successors proceed.
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::WaitingApproval => "waiting_approval",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DagState {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Paused,
}

impl std::fmt::Display for DagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// Advisory approval mode; gate nodes implement the actual policy.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    PerTask,
    EndOnly,
    GateConfigured,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DagCreator {
    Planner,
    Manual,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    pub kind: NodeKind,
    pub title: String,
    #[serde(default)]
    pub briefing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub scope: FileScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_condition: Option<GateCondition>,
    #[serde(default)]
    pub state: NodeState,
    /// Linked task once dispatched; a running task node always has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl DagNode {
    pub fn task(id: impl Into<String>, title: impl Into<String>, briefing: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Task,
            title: title.into(),
            briefing: briefing.into(),
            role: None,
            agent: AgentKind::default(),
            device_id: None,
            scope: FileScope::default(),
            gate_condition: None,
            state: NodeState::Pending,
            task_id: None,
            output: None,
            artifacts: BTreeMap::new(),
            failure_reason: None,
        }
    }

    pub fn gate(id: impl Into<String>, title: impl Into<String>, condition: GateCondition) -> Self {
        let mut node = Self::task(id, title, "");
        node.kind = NodeKind::Gate;
        node.gate_condition = Some(condition);
        node
    }
}

/// Dependency: `from` must resolve before `to` may start.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DagEdge {
    pub from: String,
    pub to: String,
}

impl DagEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dag {
    pub id: String,
    pub name: String,
    pub project: String,
    pub created_by: DagCreator,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub state: DagState,
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
    pub created_at: DateTime<Utc>,
}

impl Dag {
    pub fn new(
        name: impl Into<String>,
        project: impl Into<String>,
        created_by: DagCreator,
        nodes: Vec<DagNode>,
        edges: Vec<DagEdge>,
    ) -> Self {
        Self {
            id: overseer_core::new_id(),
            name: name.into(),
            project: project.into(),
            created_by,
            approval_mode: ApprovalMode::default(),
            state: DagState::Created,
            nodes,
            edges,
            created_at: Utc::now(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut DagNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn predecessor_ids(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == node_id)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn predecessors(&self, node_id: &str) -> Vec<&DagNode> {
        self.predecessor_ids(node_id)
            .into_iter()
            .filter_map(|id| self.node(id))
            .collect()
    }

    /// Structural validation: unique non-empty node IDs, edge endpoints
    /// present, graph acyclic.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(Error::validation("node with empty id"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(Error::validation(format!("duplicate node id '{}'", node.id)));
            }
        }
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(Error::validation(format!(
                        "edge references unknown node '{}'",
                        endpoint
                    )));
                }
            }
        }
        if let Some(node_id) = self.find_cycle() {
            return Err(Error::validation(format!(
                "cycle detected through node '{}'",
                node_id
            )));
        }
        Ok(())
    }

    /// Depth-first search with in-stack coloring. Returns a node on a cycle.
    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut color: BTreeMap<&str, Color> = ids.iter().map(|id| (*id, Color::White)).collect();

        fn visit<'a>(
            id: &'a str,
            edges: &'a [DagEdge],
            color: &mut BTreeMap<&'a str, Color>,
        ) -> Option<String> {
            color.insert(id, Color::Gray);
            for edge in edges.iter().filter(|e| e.from == id) {
                match color.get(edge.to.as_str()) {
                    Some(Color::Gray) => return Some(edge.to.clone()),
                    Some(Color::White) => {
                        if let Some(found) = visit(edge.to.as_str(), edges, color) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            color.insert(id, Color::Black);
            None
        }

        for id in ids {
            if color.get(id) == Some(&Color::White) {
                if let Some(found) = visit(id, &self.edges, &mut color) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Pending nodes whose predecessors are all resolved. With zero edges,
    /// every pending node is ready at once.
    pub fn ready_node_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Pending)
            .filter(|n| self.predecessors(&n.id).iter().all(|p| p.state.is_resolved()))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Whether some ancestor of this node has failed.
    pub fn has_failed_ancestor(&self, node_id: &str) -> bool {
        let mut queue: VecDeque<&str> = self.predecessor_ids(node_id).into();
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                if node.state == NodeState::Failed {
                    return true;
                }
            }
            queue.extend(self.predecessor_ids(id));
        }
        false
    }

    /// Overall status from node states: running while anything is live or can
    /// still progress; completed when everything resolved; failed once no
    /// pending node can make progress past a failure.
    pub fn compute_status(&self) -> DagState {
        if self.nodes.iter().all(|n| n.state.is_resolved()) {
            return DagState::Completed;
        }
        if self
            .nodes
            .iter()
            .any(|n| matches!(n.state, NodeState::Running | NodeState::WaitingApproval))
        {
            return DagState::Running;
        }
        let unblocked_pending = self
            .nodes
            .iter()
            .any(|n| n.state == NodeState::Pending && !self.has_failed_ancestor(&n.id));
        if unblocked_pending {
            return DagState::Running;
        }
        DagState::Failed
    }
}
