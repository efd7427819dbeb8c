//! HTTP surface: every endpoint the core exposes to its transport collaborator

use crate::error::ApiResult;
use crate::state::AppState;
use crate::ws::events_handler;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use overseer_core::{AgentKind, Error, Event, FileScope, Task, TaskPatch, TaskState};
use overseer_dag::{ApprovalMode, Dag, DagEdge, DagNode, GateCondition, NodeKind, PlanRequest, PlannedEdge, PlannedNode, PlannerOutput};
use overseer_devices::{Device, DeviceTask, TunnelInfo};
use overseer_hgmem::StepOutcome;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/roles", get(list_roles))
        .route("/scope/check", post(scope_check))
        .route("/events", get(events_handler))
        // Tasks
        .route("/tasks", get(list_tasks).post(create_task).delete(clear_tasks))
        .route("/tasks/:id", get(get_task).patch(patch_task).delete(delete_task))
        .route("/tasks/:id/approve", post(approve_task))
        .route("/tasks/:id/reject", post(reject_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/diff", get(task_diff))
        // DAGs
        .route("/dags", get(list_dags).post(create_dag))
        .route("/dags/:id", get(get_dag).delete(delete_dag))
        .route("/dags/:id/execute", post(execute_dag))
        .route("/dags/:id/nodes", post(insert_dag_node))
        .route("/dags/:id/nodes/:nid/approve", post(approve_dag_node))
        // Devices
        .route("/devices", get(list_devices).post(create_device))
        .route("/devices/connect", post(connect_device))
        .route("/devices/:id/heartbeat", post(device_heartbeat))
        .route("/devices/:id/tunnel", get(device_tunnel))
        .route("/devices/:id", delete(delete_device))
        // Device task polling
        .route("/device-tasks/:device_id", get(pending_device_tasks))
        .route("/device-tasks/:dt_id/pick", post(pick_device_task))
        .route("/device-tasks/:dt_id/chunk", post(chunk_device_task))
        .route("/device-tasks/:dt_id/complete", post(complete_device_task))
        .route("/device-tasks/:dt_id/fail", post(fail_device_task))
        // Hypergraph memory
        .route("/hgmem", post(hgmem_oneshot))
        .route("/hgmem/sessions", get(list_hgmem_sessions).post(create_hgmem_session))
        .route("/hgmem/sessions/:id/step", post(step_hgmem_session))
        .route("/hgmem/sessions/:id/run", post(run_hgmem_session))
        .route("/hgmem/sessions/:id/memory", get(hgmem_memory))
        .route("/hgmem/sessions/:id/stats", get(hgmem_stats))
        // Encrypted config
        .route("/config", get(list_config))
        .route("/config/:key", put(set_config).delete(delete_config))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "tasks": state.tasks.list().await.len(),
        "dags": state.executor.list().await.len(),
        "devices": state.devices.list().await.len(),
        "subscribers": state.broadcaster.subscriber_count(),
    }))
}

async fn list_roles(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "roles": state.roles.all() }))
}

#[derive(Deserialize)]
struct ScopeCheckBody {
    paths: Vec<String>,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

/// Bulk file-scope check for the dashboard and review surfaces.
async fn scope_check(Json(body): Json<ScopeCheckBody>) -> Json<overseer_core::BulkScopeResult> {
    Json(overseer_core::scope_check_all(
        &body.paths,
        &body.allow,
        &body.deny,
    ))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListTasksQuery {
    owner: Option<String>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Json<Vec<Task>> {
    let tasks = match query.owner {
        Some(owner) => state.tasks.list_by_owner(&owner).await,
        None => state.tasks.list().await,
    };
    Json(tasks)
}

fn default_owner() -> String {
    "api".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct CreateTaskBody {
    #[serde(default = "default_owner")]
    owner: String,
    project: String,
    title: String,
    briefing: String,
    role: Option<String>,
    model: Option<String>,
    #[serde(default)]
    agent: AgentKind,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
    device_id: Option<String>,
    /// Start the agent immediately (default); false parks the task pending.
    #[serde(default = "default_true")]
    start: bool,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult<Json<Task>> {
    if let Some(role) = &body.role {
        if !state.roles.exists(role) {
            return Err(Error::validation(format!("unknown role '{}'", role)).into());
        }
    }
    let mut task = Task::new(body.owner, body.project, body.title, body.briefing);
    task.role = body.role;
    task.model = body.model;
    task.agent = body.agent;
    task.scope = FileScope {
        allow: body.allow,
        deny: body.deny,
    };
    let task = state.tasks.create(task).await;
    if body.start {
        state.spawn_task_run(task.id.clone(), body.device_id);
    }
    Ok(Json(task))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = state
        .tasks
        .get(&id)
        .await
        .ok_or_else(|| Error::not_found("task", &id))?;
    Ok(Json(task))
}

/// Partial-merge update, the review surface's entry point: patching
/// `status: reviewing` parks a task for a human decision.
async fn patch_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<TaskPatch>,
) -> ApiResult<Json<Task>> {
    let status_change = body.status;
    let task = state.tasks.patch(&id, body).await?;
    if let Some(status) = status_change {
        state.broadcaster.broadcast(Event::TaskUpdated {
            task_id: id,
            status,
        });
    }
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.runner.is_active(&id) {
        return Err(Error::conflict(format!("task {} is running", id)).into());
    }
    state.tasks.delete(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn clear_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let any_active = state
        .tasks
        .list()
        .await
        .iter()
        .any(|t| state.runner.is_active(&t.id));
    if any_active {
        return Err(Error::conflict("tasks still running").into());
    }
    let deleted = state.tasks.clear().await;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let mut approved = false;
    let task = state
        .tasks
        .update(&id, |t| {
            if t.status == TaskState::Reviewing {
                t.status = TaskState::Completed;
                t.completed_at = Some(chrono::Utc::now());
                approved = true;
            }
        })
        .await?;
    if !approved {
        return Err(Error::conflict(format!("task {} is not in review", id)).into());
    }
    state.broadcaster.broadcast(Event::TaskCompleted {
        task_id: id.clone(),
    });
    // Mirror the approval onto any linked DAG node and re-advance.
    state
        .executor
        .on_task_terminal(&id, TaskState::Completed)
        .await;
    Ok(Json(task))
}

#[derive(Deserialize, Default)]
struct RejectBody {
    reason: Option<String>,
}

async fn reject_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<Json<Task>> {
    let reason = body
        .and_then(|b| b.0.reason)
        .unwrap_or_else(|| "rejected by reviewer".to_string());
    let mut rejected = false;
    let task = state
        .tasks
        .update(&id, |t| {
            if matches!(t.status, TaskState::Reviewing | TaskState::Completed) {
                t.status = TaskState::Rejected;
                t.failure_reason = Some(reason.clone());
                rejected = true;
            }
        })
        .await?;
    if !rejected {
        return Err(Error::conflict(format!("task {} cannot be rejected", id)).into());
    }
    state.broadcaster.broadcast(Event::TaskUpdated {
        task_id: id.clone(),
        status: TaskState::Rejected,
    });
    // A rejected task reads as a failure to its DAG node; re-advance so the
    // graph settles instead of waiting on a node that will never resolve.
    state
        .executor
        .on_task_terminal(&id, TaskState::Rejected)
        .await;
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let status = state.runner.cancel(&id).await?;
    Ok(Json(json!({ "task_id": id, "status": status })))
}

async fn task_diff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = state
        .tasks
        .get(&id)
        .await
        .ok_or_else(|| Error::not_found("task", &id))?;
    let diff = task
        .diff
        .ok_or_else(|| Error::not_found("diff for task", &id))?;
    Ok(Json(json!({ "task_id": id, "diff": diff })))
}

// ---------------------------------------------------------------------------
// DAGs
// ---------------------------------------------------------------------------

async fn list_dags(State(state): State<Arc<AppState>>) -> Json<Vec<Dag>> {
    Json(state.executor.list().await)
}

/// Either a brief for the planner or a fully-formed node/edge definition.
#[derive(Deserialize)]
struct CreateDagBody {
    project: String,
    brief: Option<String>,
    context: Option<String>,
    name: Option<String>,
    approval_mode: Option<ApprovalMode>,
    nodes: Option<Vec<PlannedNode>>,
    edges: Option<Vec<PlannedEdge>>,
}

async fn create_dag(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDagBody>,
) -> ApiResult<Json<Dag>> {
    let output = if let Some(brief) = body.brief {
        state
            .planner
            .plan_brief(&PlanRequest {
                project: body.project.clone(),
                brief,
                context: body.context,
            })
            .await?
    } else {
        let nodes = body
            .nodes
            .ok_or_else(|| Error::validation("either 'brief' or 'nodes' is required"))?;
        PlannerOutput {
            name: body.name.unwrap_or_else(|| "unnamed plan".to_string()),
            description: String::new(),
            approval_mode: body.approval_mode.unwrap_or_default(),
            nodes,
            edges: body.edges.unwrap_or_default(),
        }
    };
    let dag = state.executor.create(output.into_dag(&body.project)).await?;
    Ok(Json(dag))
}

async fn get_dag(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Dag>> {
    Ok(Json(state.executor.get(&id).await?))
}

async fn execute_dag(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Dag>> {
    Ok(Json(state.executor.execute(&id).await?))
}

#[derive(Deserialize)]
struct InsertNodeBody {
    id: String,
    #[serde(default = "task_kind")]
    kind: NodeKind,
    title: String,
    #[serde(default)]
    briefing: String,
    role: Option<String>,
    #[serde(default)]
    agent: AgentKind,
    device_id: Option<String>,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
    gate_condition: Option<GateCondition>,
    #[serde(default)]
    edges: Vec<PlannedEdge>,
}

fn task_kind() -> NodeKind {
    NodeKind::Task
}

async fn insert_dag_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InsertNodeBody>,
) -> ApiResult<Json<Dag>> {
    let mut node = DagNode::task(body.id, body.title, body.briefing);
    node.kind = body.kind;
    node.role = body.role;
    node.agent = body.agent;
    node.device_id = body.device_id;
    node.scope = FileScope {
        allow: body.allow,
        deny: body.deny,
    };
    node.gate_condition = body.gate_condition;
    let edges = body
        .edges
        .into_iter()
        .map(|e| DagEdge::new(e.from, e.to))
        .collect();
    Ok(Json(state.executor.insert_node(&id, node, edges).await?))
}

async fn approve_dag_node(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(String, String)>,
) -> ApiResult<Json<Dag>> {
    state.executor.approve_node(&id, &node_id).await?;
    Ok(Json(state.executor.get(&id).await?))
}

async fn delete_dag(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.executor.delete(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<Device>> {
    Json(state.devices.list().await)
}

#[derive(Deserialize)]
struct CreateDeviceBody {
    name: String,
    #[serde(default, rename = "type")]
    device_type: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn create_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDeviceBody>,
) -> Json<Value> {
    let (device, token) = state
        .devices
        .create(&body.name, &body.device_type, body.tags)
        .await;
    // The plaintext token appears in this response and nowhere else.
    Json(json!({ "device": device, "token": token }))
}

#[derive(Deserialize)]
struct ConnectBody {
    token: String,
    #[serde(default)]
    capabilities: HashMap<String, Value>,
    hostname: Option<String>,
}

async fn connect_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectBody>,
) -> ApiResult<Json<Device>> {
    let device = state
        .devices
        .connect(&body.token, body.capabilities, body.hostname)
        .await?;
    Ok(Json(device))
}

#[derive(Deserialize, Default)]
struct HeartbeatBody {
    capabilities: Option<HashMap<String, Value>>,
    metrics: Option<Value>,
}

async fn device_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<HeartbeatBody>>,
) -> ApiResult<Json<Device>> {
    let body = body.map(|b| b.0).unwrap_or_default();
    let device = state
        .devices
        .heartbeat(&id, body.capabilities, body.metrics)
        .await?;
    Ok(Json(device))
}

async fn device_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TunnelInfo>> {
    let tunnel = state
        .devices
        .tunnel(&id)
        .await?
        .ok_or_else(|| Error::not_found("tunnel for device", &id))?;
    Ok(Json(tunnel))
}

async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    // In-flight work fails with "device gone" and wakes any waiting runner.
    let abandoned = state.queue.abandon_device(&id).await;
    state.devices.delete(&id).await?;
    Ok(Json(json!({ "deleted": id, "abandoned_tasks": abandoned.len() })))
}

// ---------------------------------------------------------------------------
// Device task polling
// ---------------------------------------------------------------------------

async fn pending_device_tasks(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Json<Vec<DeviceTask>> {
    Json(state.queue.pending_for_device(&device_id).await)
}

async fn pick_device_task(
    State(state): State<Arc<AppState>>,
    Path(dt_id): Path<String>,
) -> ApiResult<Json<DeviceTask>> {
    Ok(Json(state.queue.pick(&dt_id).await?))
}

#[derive(Deserialize)]
struct ChunkBody {
    chunk: String,
}

async fn chunk_device_task(
    State(state): State<Arc<AppState>>,
    Path(dt_id): Path<String>,
    Json(body): Json<ChunkBody>,
) -> ApiResult<Json<Value>> {
    state.queue.append_chunk(&dt_id, &body.chunk).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize, Default)]
struct CompleteBody {
    output: Option<String>,
}

async fn complete_device_task(
    State(state): State<Arc<AppState>>,
    Path(dt_id): Path<String>,
    body: Option<Json<CompleteBody>>,
) -> ApiResult<Json<DeviceTask>> {
    let output = body.and_then(|b| b.0.output);
    Ok(Json(state.queue.complete(&dt_id, output).await?))
}

#[derive(Deserialize)]
struct FailBody {
    error: String,
}

async fn fail_device_task(
    State(state): State<Arc<AppState>>,
    Path(dt_id): Path<String>,
    Json(body): Json<FailBody>,
) -> ApiResult<Json<DeviceTask>> {
    Ok(Json(state.queue.fail(&dt_id, &body.error).await?))
}

// ---------------------------------------------------------------------------
// Hypergraph memory
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct HgmemBody {
    query: String,
    #[serde(default)]
    project: String,
}

async fn hgmem_oneshot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HgmemBody>,
) -> ApiResult<Json<Value>> {
    let session = state.engine.create_session(&body.query, &body.project).await;
    let finished = state.engine.run(&session.id).await?;
    Ok(Json(json!({
        "session_id": finished.id,
        "response": finished.response,
        "steps": finished.step,
        "tokens_used": finished.tokens_used,
    })))
}

async fn list_hgmem_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "sessions": state.hg_sessions.list().await }))
}

async fn create_hgmem_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HgmemBody>,
) -> Json<Value> {
    let session = state.engine.create_session(&body.query, &body.project).await;
    Json(json!({ "session": session }))
}

async fn step_hgmem_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.engine.step(&id).await?;
    let body = match outcome {
        StepOutcome::Continued { step } => json!({ "outcome": "continued", "step": step }),
        StepOutcome::Done { response } => json!({ "outcome": "done", "response": response }),
    };
    Ok(Json(body))
}

async fn run_hgmem_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.engine.run(&id).await?;
    Ok(Json(json!({ "session": session })))
}

async fn hgmem_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let graph = state.engine.memory(&id).await?;
    Ok(Json(json!({ "memory": graph })))
}

async fn hgmem_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let stats = state.engine.stats(&id).await?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ---------------------------------------------------------------------------
// Encrypted config
// ---------------------------------------------------------------------------

fn config_store(state: &AppState) -> Result<&Arc<overseer_store::ConfigStore>, Error> {
    state
        .config_store
        .as_ref()
        .ok_or_else(|| Error::validation("config store not configured (set OVERSEER_MASTER_SECRET)"))
}

async fn list_config(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let store = config_store(&state)?;
    Ok(Json(json!({ "entries": store.list().await })))
}

#[derive(Deserialize)]
struct SetConfigBody {
    value: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_true")]
    masked: bool,
}

async fn set_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<SetConfigBody>,
) -> ApiResult<Json<Value>> {
    let store = config_store(&state)?;
    store
        .set(&key, &body.value, &body.category, &body.description, body.masked)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    let store = config_store(&state)?;
    store.delete(&key).await?;
    Ok(Json(json!({ "deleted": key })))
}
