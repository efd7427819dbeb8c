//! Process wiring: every component built once and injected explicitly

use overseer_core::Broadcaster;
use overseer_dag::{DagExecutor, DagStore, PlannerClient};
use overseer_devices::{DeviceRegistry, DeviceTaskQueue};
use overseer_hgmem::{EngineConfig, MemoryEngine, SessionStore};
use overseer_knowledge::KnowledgeQuery;
use overseer_llm::{AnthropicProvider, CompletionRequest, LlmError, LlmProvider, LlmResult};
use overseer_runner::{RunnerConfig, TaskRunner};
use overseer_store::{ConfigStore, RoleRegistry, TaskStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Environment-driven configuration for the gateway process.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub state_dir: PathBuf,
    pub projects_root: PathBuf,
    pub master_secret: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub model: Option<String>,
    pub task_timeout_secs: Option<u64>,
    pub claude_command: Option<String>,
    pub augment_command: Option<String>,
    pub use_pty_wrap: Option<bool>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: std::env::var("OVERSEER_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".overseer")),
            projects_root: std::env::var("OVERSEER_PROJECTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            master_secret: std::env::var("OVERSEER_MASTER_SECRET").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            anthropic_base_url: std::env::var("OVERSEER_ANTHROPIC_BASE_URL").ok(),
            model: std::env::var("OVERSEER_MODEL").ok(),
            task_timeout_secs: std::env::var("OVERSEER_TASK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            claude_command: std::env::var("OVERSEER_CLAUDE_CMD").ok(),
            augment_command: std::env::var("OVERSEER_AUGMENT_CMD").ok(),
            use_pty_wrap: std::env::var("OVERSEER_PTY_WRAP")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Placeholder provider for processes started without an API key. Every call
/// fails as an external error; the components degrade per their contracts.
struct UnconfiguredProvider;

#[async_trait::async_trait]
impl LlmProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _request: CompletionRequest) -> LlmResult<overseer_llm::Completion> {
        Err(LlmError::RequestFailed(
            "no LLM provider configured (set ANTHROPIC_API_KEY)".to_string(),
        ))
    }
}

pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub tasks: Arc<TaskStore>,
    pub roles: Arc<RoleRegistry>,
    pub runner: Arc<TaskRunner>,
    pub devices: Arc<DeviceRegistry>,
    pub queue: Arc<DeviceTaskQueue>,
    pub executor: Arc<DagExecutor>,
    pub planner: Arc<PlannerClient>,
    pub engine: Arc<MemoryEngine>,
    pub hg_sessions: Arc<SessionStore>,
    pub config_store: Option<Arc<ConfigStore>>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the full component graph. Restart recovery runs here, in
    /// dependency order: the device queue first (it resets interrupted device
    /// tasks to pending), then the task store cross-checks it.
    pub async fn wire(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let dir = &config.state_dir;
        let broadcaster = Arc::new(Broadcaster::new());

        let queue = Arc::new(DeviceTaskQueue::load(
            dir.join("device-tasks.json"),
            Arc::clone(&broadcaster),
        ));
        let tasks = Arc::new(TaskStore::load(dir.join("tasks.json")));
        let waiting = queue.pending_parent_ids().await;
        tasks.recover(&waiting).await;

        let roles = Arc::new(RoleRegistry::load(dir.join("settings.json")));
        let knowledge = KnowledgeQuery::disconnected();

        let mut runner_config = RunnerConfig::default();
        if let Some(secs) = config.task_timeout_secs {
            runner_config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(cmd) = &config.claude_command {
            runner_config.claude_command = cmd.clone();
        }
        if let Some(cmd) = &config.augment_command {
            runner_config.augment_command = cmd.clone();
        }
        if let Some(wrap) = config.use_pty_wrap {
            runner_config.use_pty_wrap = wrap;
        }
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&tasks),
            Arc::clone(&roles),
            knowledge.clone(),
            Arc::clone(&queue),
            Arc::clone(&broadcaster),
            runner_config,
        ));

        let dag_store = Arc::new(DagStore::load(dir.join("dags.json")));
        let executor = Arc::new(DagExecutor::new(
            dag_store,
            Arc::clone(&tasks),
            Arc::clone(&runner),
            Arc::clone(&roles),
            Arc::clone(&broadcaster),
        ));
        executor.attach_output_forwarding();

        let devices = Arc::new(DeviceRegistry::load(
            dir.join("devices.json"),
            Arc::clone(&broadcaster),
        ));
        let _sweep = devices.spawn_health_sweep();

        let model = config
            .model
            .clone()
            .unwrap_or_else(|| roles.default_model().to_string());
        let provider: Arc<dyn LlmProvider> = match &config.anthropic_api_key {
            Some(key) => {
                let mut provider = AnthropicProvider::new(key);
                if let Some(base) = &config.anthropic_base_url {
                    provider = provider.with_base_url(format!("{}/v1/messages", base));
                }
                Arc::new(provider)
            }
            None => {
                warn!("ANTHROPIC_API_KEY not set; planner and memory engine calls will fail");
                Arc::new(UnconfiguredProvider)
            }
        };

        let planner = Arc::new(PlannerClient::new(
            Arc::clone(&provider),
            Arc::clone(&roles),
            model.clone(),
        ));

        let hg_sessions = Arc::new(SessionStore::load(dir.join("hgmem-sessions.json")));
        let engine = Arc::new(MemoryEngine::new(
            provider,
            knowledge,
            Arc::clone(&hg_sessions),
            Arc::clone(&broadcaster),
            EngineConfig {
                model,
                ..EngineConfig::default()
            },
        ));

        let config_store = match &config.master_secret {
            Some(secret) => Some(Arc::new(ConfigStore::open(dir.join("config.json"), secret)?)),
            None => None,
        };

        info!(state_dir = %dir.display(), "overseer core wired");
        Ok(Arc::new(Self {
            broadcaster,
            tasks,
            roles,
            runner,
            devices,
            queue,
            executor,
            planner,
            engine,
            hg_sessions,
            config_store,
            started_at: Instant::now(),
        }))
    }

    /// Fire-and-forget execution of a standalone task; terminal states still
    /// route through the executor in case a mapping exists.
    pub fn spawn_task_run(self: &Arc<Self>, task_id: String, device: Option<String>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let terminal = state.runner.run(&task_id, device).await;
            state.executor.on_task_terminal(&task_id, terminal).await;
        });
    }
}
