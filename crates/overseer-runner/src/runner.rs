//! Task execution: local subprocess or remote device, owned end-to-end.
//!
//! The runner exclusively owns the subprocess while a task runs. Output is
//! drained by monitor tasks that capture and broadcast each line; the main
//! loop races process exit against cancellation and the wall-clock budget.

use crate::prompt::assemble_prompt;
use crate::stream::{ClaudeStreamParser, ParsedLine, PlainStreamParser, StreamItem};
use chrono::Utc;
use dashmap::DashMap;
use overseer_core::{
    AgentKind, Broadcaster, Error, Event, OutputLine, OutputStream, Result, Task, TaskState,
};
use overseer_devices::{DeviceTaskQueue, DeviceTaskState, DEVICE_WAIT_TIMEOUT};
use overseer_knowledge::KnowledgeQuery;
use overseer_store::{RoleRegistry, TaskStore};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TIMEOUT_REASON: &str = "timeout";
pub const CANCELLED_REASON: &str = "cancelled by user";

#[derive(Clone)]
pub struct RunnerConfig {
    /// Wall-clock budget for a local task.
    pub task_timeout: Duration,
    /// How long a dispatched device task is awaited.
    pub device_wait: Duration,
    /// Knowledge snippets spliced into the prompt.
    pub knowledge_snippets: usize,
    /// Claude-family CLI; empty string selects the echo fallback.
    pub claude_command: String,
    /// Augment-family CLI; empty string selects the echo fallback.
    pub augment_command: String,
    /// Wrap non-Claude CLIs in a pseudo-terminal so headless spawn succeeds.
    pub use_pty_wrap: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30 * 60),
            device_wait: DEVICE_WAIT_TIMEOUT,
            knowledge_snippets: 3,
            claude_command: "claude".to_string(),
            augment_command: "augment".to_string(),
            use_pty_wrap: true,
        }
    }
}

pub struct TaskRunner {
    tasks: Arc<TaskStore>,
    roles: Arc<RoleRegistry>,
    knowledge: KnowledgeQuery,
    queue: Arc<DeviceTaskQueue>,
    broadcaster: Arc<Broadcaster>,
    config: RunnerConfig,
    /// Cancellation handles for live tasks.
    active: DashMap<String, CancellationToken>,
}

enum LocalOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

impl TaskRunner {
    pub fn new(
        tasks: Arc<TaskStore>,
        roles: Arc<RoleRegistry>,
        knowledge: KnowledgeQuery,
        queue: Arc<DeviceTaskQueue>,
        broadcaster: Arc<Broadcaster>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            tasks,
            roles,
            knowledge,
            queue,
            broadcaster,
            config,
            active: DashMap::new(),
        }
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    /// Execute a task end-to-end and return its terminal state.
    ///
    /// `device_binding` is an explicit device pin (from a DAG node); role
    /// policy supplies one otherwise.
    pub async fn run(self: &Arc<Self>, task_id: &str, device_binding: Option<String>) -> TaskState {
        let Some(task) = self.tasks.get(task_id).await else {
            warn!(task = %task_id, "run requested for unknown task");
            return TaskState::Failed;
        };
        if task.status != TaskState::Pending {
            warn!(task = %task_id, status = %task.status, "double start rejected");
            return task.status;
        }

        let cancel = CancellationToken::new();
        self.active.insert(task.id.clone(), cancel.clone());

        let role = task.role.as_deref().and_then(|id| self.roles.get(id));

        let _ = self
            .tasks
            .update(&task.id, |t| {
                t.status = TaskState::Running;
                t.started_at = Some(Utc::now());
            })
            .await;
        self.broadcaster.broadcast(Event::TaskStarted {
            task_id: task.id.clone(),
            project: task.project.clone(),
            title: task.title.clone(),
        });
        self.broadcaster.broadcast(Event::TaskUpdated {
            task_id: task.id.clone(),
            status: TaskState::Running,
        });

        let prompt = assemble_prompt(&task, role, &self.knowledge, self.config.knowledge_snippets).await;

        let device = device_binding.or_else(|| role.and_then(|r| r.device_id.clone()));
        let final_state = match (device, task.agent) {
            (Some(device_id), _) => self.run_on_device(&task, &device_id, &prompt, &cancel).await,
            (None, AgentKind::RemoteDevice) => {
                self.finish_failed(&task.id, "no device bound for remote task").await
            }
            (None, _) => self.run_local(&task, &prompt, &cancel).await,
        };

        self.active.remove(&task.id);
        final_state
    }

    /// Kill the task's subprocess (or abandon its device task) and fail it
    /// with "cancelled by user". The transition happens inside this call.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskState> {
        let Some((_, token)) = self.active.remove(task_id) else {
            return Err(Error::conflict(format!("task {} is not running", task_id)));
        };
        let state = self.finish_failed(task_id, CANCELLED_REASON).await;
        token.cancel();
        Ok(state)
    }

    // ---------------------------------------------------------------------
    // Device dispatch
    // ---------------------------------------------------------------------

    async fn run_on_device(
        &self,
        task: &Task,
        device_id: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> TaskState {
        let model = self
            .roles
            .resolve_model(task.role.as_deref(), task.model.as_deref());
        self.broadcaster.broadcast(Event::TaskModelResolved {
            task_id: task.id.clone(),
            model: model.clone(),
        });

        let dt = self.queue.enqueue(&task.id, device_id, &model, prompt).await;
        info!(task = %task.id, device = %device_id, device_task = %dt.id, "dispatched to device");

        tokio::select! {
            settled = self.queue.wait_for_completion(&dt.id, self.config.device_wait) => {
                match settled {
                    Ok(dt) if dt.state == DeviceTaskState::Completed => {
                        let lines: Vec<OutputLine> = dt
                            .output
                            .lines()
                            .filter(|l| !l.trim().is_empty())
                            .map(|l| OutputLine::new(OutputStream::Stdout, l))
                            .collect();
                        let _ = self.tasks.update(&task.id, |t| t.output.extend(lines)).await;
                        self.finish_completed(&task.id).await
                    }
                    Ok(dt) => {
                        let reason = dt.error.unwrap_or_else(|| "device task failed".to_string());
                        self.finish_failed(&task.id, &reason).await
                    }
                    Err(e) => {
                        let reason = match e {
                            Error::Timeout(_) => overseer_devices::queue::WAIT_TIMEOUT_REASON.to_string(),
                            other => other.to_string(),
                        };
                        self.finish_failed(&task.id, &reason).await
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = self.queue.fail(&dt.id, CANCELLED_REASON).await;
                self.finish_failed(&task.id, CANCELLED_REASON).await
            }
        }
    }

    // ---------------------------------------------------------------------
    // Local subprocess dispatch
    // ---------------------------------------------------------------------

    async fn run_local(
        self: &Arc<Self>,
        task: &Task,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> TaskState {
        let model = self
            .roles
            .resolve_model(task.role.as_deref(), task.model.as_deref());
        let (program, args) = self.build_command(task, prompt, &model);
        debug!(task = %task.id, program = %program, "spawning agent");

        let mut child = match Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return self
                    .finish_failed(&task.id, &format!("spawn failed: {}", e))
                    .await;
            }
        };

        if task.agent != AgentKind::LocalClaude {
            // Claude announces its own model on the stream; others run what
            // the registry resolved.
            self.resolve_model(&task.id, model).await;
        }

        let is_claude = task.agent == AgentKind::LocalClaude;
        let stdout_task = child.stdout.take().map(|pipe| {
            let runner = Arc::clone(self);
            let task_id = task.id.clone();
            tokio::spawn(async move { runner.drain_stdout(pipe, &task_id, is_claude).await })
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            let runner = Arc::clone(self);
            let task_id = task.id.clone();
            tokio::spawn(async move { runner.drain_stderr(pipe, &task_id).await })
        });

        let outcome = tokio::select! {
            status = child.wait() => LocalOutcome::Exited(status),
            _ = cancel.cancelled() => LocalOutcome::Cancelled,
            _ = tokio::time::sleep(self.config.task_timeout) => LocalOutcome::TimedOut,
        };

        match outcome {
            LocalOutcome::Exited(Ok(status)) => {
                // Drain to EOF before the terminal transition so every output
                // line precedes the terminal event.
                if let Some(handle) = stdout_task {
                    let _ = handle.await;
                }
                if let Some(handle) = stderr_task {
                    let _ = handle.await;
                }
                if status.success() {
                    self.finish_completed(&task.id).await
                } else {
                    self.finish_failed(
                        &task.id,
                        &format!("agent exited with code {}", status.code().unwrap_or(-1)),
                    )
                    .await
                }
            }
            LocalOutcome::Exited(Err(e)) => {
                abort_all(stdout_task, stderr_task);
                self.finish_failed(&task.id, &format!("wait failed: {}", e)).await
            }
            LocalOutcome::Cancelled => {
                let _ = child.start_kill();
                abort_all(stdout_task, stderr_task);
                self.finish_failed(&task.id, CANCELLED_REASON).await
            }
            LocalOutcome::TimedOut => {
                warn!(task = %task.id, "task exceeded wall-clock budget");
                let _ = child.start_kill();
                abort_all(stdout_task, stderr_task);
                self.finish_failed(&task.id, TIMEOUT_REASON).await
            }
        }
    }

    fn build_command(&self, task: &Task, prompt: &str, model: &str) -> (String, Vec<String>) {
        match task.agent {
            AgentKind::LocalClaude => {
                if self.config.claude_command.is_empty() {
                    return ("echo".to_string(), vec![task.briefing.clone()]);
                }
                (
                    self.config.claude_command.clone(),
                    vec![
                        "-p".to_string(),
                        prompt.to_string(),
                        "--output-format".to_string(),
                        "stream-json".to_string(),
                        "--verbose".to_string(),
                        "--model".to_string(),
                        model.to_string(),
                    ],
                )
            }
            AgentKind::LocalAugment => {
                if self.config.augment_command.is_empty() {
                    return ("echo".to_string(), vec![task.briefing.clone()]);
                }
                if cfg!(unix) && self.config.use_pty_wrap {
                    // Headless spawn needs a tty for this CLI; Claude's
                    // stream-json mode does not.
                    (
                        "script".to_string(),
                        vec![
                            "-qec".to_string(),
                            format!("{} {}", self.config.augment_command, shell_quote(prompt)),
                            "/dev/null".to_string(),
                        ],
                    )
                } else {
                    (self.config.augment_command.clone(), vec![prompt.to_string()])
                }
            }
            // Unreachable through dispatch; kept as the echo fallback.
            AgentKind::RemoteDevice => ("echo".to_string(), vec![task.briefing.clone()]),
        }
    }

    async fn drain_stdout(
        &self,
        mut pipe: tokio::process::ChildStdout,
        task_id: &str,
        is_claude: bool,
    ) {
        let mut claude = ClaudeStreamParser::new();
        let mut plain = PlainStreamParser::new(OutputStream::Stdout);
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if is_claude {
                        for item in claude.feed(&buf[..n]) {
                            match item {
                                StreamItem::Model(model) => self.resolve_model(task_id, model).await,
                                StreamItem::Line(line) => self.capture_line(task_id, line).await,
                            }
                        }
                    } else {
                        for line in plain.feed(&buf[..n]) {
                            self.capture_line(task_id, line).await;
                        }
                    }
                }
            }
        }
    }

    async fn drain_stderr(&self, mut pipe: tokio::process::ChildStderr, task_id: &str) {
        let mut parser = PlainStreamParser::new(OutputStream::Stderr);
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in parser.feed(&buf[..n]) {
                        self.capture_line(task_id, line).await;
                    }
                }
            }
        }
    }

    async fn capture_line(&self, task_id: &str, parsed: ParsedLine) {
        let mut captured = false;
        let result = self
            .tasks
            .update(task_id, |t| {
                if !t.status.is_terminal() {
                    t.output
                        .push(OutputLine::new(parsed.stream, parsed.line.clone()));
                    captured = true;
                }
            })
            .await;
        // Output past a terminal transition is discarded, never broadcast.
        if result.is_ok() && captured {
            self.broadcaster.broadcast(Event::TaskOutput {
                task_id: task_id.to_string(),
                stream: parsed.stream,
                line: parsed.line,
            });
        }
    }

    async fn resolve_model(&self, task_id: &str, model: String) {
        let _ = self
            .tasks
            .update(task_id, |t| t.model = Some(model.clone()))
            .await;
        self.broadcaster.broadcast(Event::TaskModelResolved {
            task_id: task_id.to_string(),
            model,
        });
    }

    /// Transition to completed unless already terminal; exactly one terminal
    /// event per task.
    async fn finish_completed(&self, task_id: &str) -> TaskState {
        let mut transitioned = false;
        let result = self
            .tasks
            .update(task_id, |t| {
                if !t.status.is_terminal() {
                    t.status = TaskState::Completed;
                    t.completed_at = Some(Utc::now());
                    transitioned = true;
                }
            })
            .await;
        if transitioned {
            info!(task = %task_id, "task completed");
            self.broadcaster.broadcast(Event::TaskCompleted {
                task_id: task_id.to_string(),
            });
        }
        result.map(|t| t.status).unwrap_or(TaskState::Failed)
    }

    async fn finish_failed(&self, task_id: &str, reason: &str) -> TaskState {
        let mut transitioned = false;
        let result = self
            .tasks
            .update(task_id, |t| {
                if !t.status.is_terminal() {
                    t.status = TaskState::Failed;
                    t.failure_reason = Some(reason.to_string());
                    t.completed_at = Some(Utc::now());
                    transitioned = true;
                }
            })
            .await;
        if transitioned {
            warn!(task = %task_id, reason = %reason, "task failed");
            self.broadcaster.broadcast(Event::TaskFailed {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            });
        }
        result.map(|t| t.status).unwrap_or(TaskState::Failed)
    }
}

fn abort_all(
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(handle) = stdout {
        handle.abort();
    }
    if let Some(handle) = stderr {
        handle.abort();
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
