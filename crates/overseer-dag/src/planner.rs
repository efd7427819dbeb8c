//! Planner client: expand a project brief into a DAG via an external LLM.
//!
//! The model answers in a strict JSON shape; truncated responses go through
//! the shared repair pass before validation. Validation failures surface to
//! the caller — there is no canned-DAG fallback.

use crate::types::{ApprovalMode, Dag, DagCreator, DagEdge, DagNode, GateCondition, NodeKind};
use overseer_core::{AgentKind, Error, FileScope, Result};
use overseer_llm::{json, CompletionRequest, LlmProvider};
use overseer_store::{RoleRegistry, DEFAULT_ROLE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

const PLANNER_TEMPERATURE: f32 = 0.3;
const PLANNER_MAX_TOKENS: u32 = 8192;

#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub project: String,
    pub brief: String,
    pub context: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedNode {
    pub id: String,
    #[serde(default = "default_kind")]
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
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_condition: Option<GateCondition>,
}

fn default_kind() -> NodeKind {
    NodeKind::Task
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedEdge {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannerOutput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    pub nodes: Vec<PlannedNode>,
    #[serde(default)]
    pub edges: Vec<PlannedEdge>,
}

impl PlannerOutput {
    /// Materialize the plan as a DAG record (acyclicity is checked at DAG
    /// creation, not here).
    pub fn into_dag(self, project: &str) -> Dag {
        let nodes = self
            .nodes
            .into_iter()
            .map(|n| {
                let mut node = DagNode::task(n.id, n.title, n.briefing);
                node.kind = n.kind;
                node.role = n.role;
                node.agent = n.agent;
                node.device_id = n.device_id;
                node.scope = FileScope {
                    allow: n.allow,
                    deny: n.deny,
                };
                node.gate_condition = n.gate_condition;
                node
            })
            .collect();
        let edges = self
            .edges
            .into_iter()
            .map(|e| DagEdge::new(e.from, e.to))
            .collect();
        let mut dag = Dag::new(self.name, project, DagCreator::Planner, nodes, edges);
        dag.approval_mode = self.approval_mode;
        dag
    }
}

pub struct PlannerClient {
    provider: Arc<dyn LlmProvider>,
    roles: Arc<RoleRegistry>,
    model: String,
}

impl PlannerClient {
    pub fn new(provider: Arc<dyn LlmProvider>, roles: Arc<RoleRegistry>, model: impl Into<String>) -> Self {
        Self {
            provider,
            roles,
            model: model.into(),
        }
    }

    fn system_prompt(&self) -> String {
        let role_list = self
            .roles
            .all()
            .iter()
            .map(|r| {
                format!(
                    "- {} — {} (capabilities: {})",
                    r.id,
                    r.description,
                    r.capabilities.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are a project planner for a fleet of coding agents. Decompose the \
             brief into a directed acyclic graph of small tasks.\n\n\
             Available agent roles:\n{}\n\n\
             Respond with ONLY a JSON document of this shape:\n\
             {{\n\
             \x20 \"name\": \"short plan name\",\n\
             \x20 \"description\": \"one paragraph\",\n\
             \x20 \"approval_mode\": \"per_task\" | \"end_only\" | \"gate_configured\",\n\
             \x20 \"nodes\": [{{\"id\": \"n1\", \"kind\": \"task\" | \"gate\" | \"fan_out\" | \"fan_in\", \
             \"title\": \"...\", \"briefing\": \"...\", \"role\": \"implementer\", \
             \"allow\": [\"src/**\"], \"deny\": [], \
             \"gate_condition\": \"all_pass\" | \"any_pass\" | \"manual\"}}],\n\
             \x20 \"edges\": [{{\"from\": \"n1\", \"to\": \"n2\"}}]\n\
             }}\n\n\
             Node ids must be unique. Every edge endpoint must name an existing node. \
             Gate nodes need gate_condition and no briefing. Keep briefings concrete \
             and self-contained.",
            role_list
        )
    }

    pub async fn plan_brief(&self, request: &PlanRequest) -> Result<PlannerOutput> {
        let mut user = format!("Project: {}\n\nBrief:\n{}", request.project, request.brief);
        if let Some(context) = &request.context {
            user.push_str(&format!("\n\nContext:\n{}", context));
        }

        let completion = self
            .provider
            .complete(
                CompletionRequest::one_shot(&self.model, self.system_prompt(), user)
                    .with_temperature(PLANNER_TEMPERATURE)
                    .with_max_tokens(PLANNER_MAX_TOKENS),
            )
            .await
            .map_err(|e| Error::external(format!("planner llm call failed: {}", e)))?;

        let raw = json::extract(&completion.text)
            .ok_or_else(|| Error::validation("planner returned no JSON document"))?;

        let parsed: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(first_err) if completion.finish_reason.is_truncated() => {
                warn!("planner response truncated, attempting repair");
                let repaired = json::repair_truncated(&raw);
                serde_json::from_str(&repaired).map_err(|_| {
                    Error::validation(format!("planner JSON unrecoverable: {}", first_err))
                })?
            }
            Err(e) => {
                return Err(Error::validation(format!("planner JSON invalid: {}", e)));
            }
        };

        let mut output: PlannerOutput = serde_json::from_value(parsed)
            .map_err(|e| Error::validation(format!("planner output shape invalid: {}", e)))?;
        self.validate(&mut output)?;
        info!(
            nodes = output.nodes.len(),
            edges = output.edges.len(),
            "plan generated"
        );
        Ok(output)
    }

    /// Structural validation plus role coercion. Acyclicity runs inside the
    /// DAG store on create.
    fn validate(&self, output: &mut PlannerOutput) -> Result<()> {
        if output.nodes.is_empty() {
            return Err(Error::validation("plan has no nodes"));
        }
        let mut ids = HashSet::new();
        for node in &output.nodes {
            if node.id.is_empty() {
                return Err(Error::validation("plan node with empty id"));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate plan node id '{}'",
                    node.id
                )));
            }
        }
        for edge in &output.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(Error::validation(format!(
                        "plan edge references unknown node '{}'",
                        endpoint
                    )));
                }
            }
        }
        for node in output.nodes.iter_mut() {
            if node.kind == NodeKind::Task {
                if let Some(role) = &node.role {
                    if !self.roles.exists(role) {
                        warn!(role = %role, node = %node.id, "unknown role coerced to default");
                        node.role = Some(DEFAULT_ROLE.to_string());
                    }
                }
            }
        }
        Ok(())
    }
}
