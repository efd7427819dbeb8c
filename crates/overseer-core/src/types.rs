//! Core task model shared by the store, runner, and DAG executor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of agent executes a task.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentKind {
    #[default]
    #[serde(rename = "local-claude")]
    LocalClaude,
    #[serde(rename = "local-augment")]
    LocalAugment,
    #[serde(rename = "remote-device")]
    RemoteDevice,
}

/// Task lifecycle states. Terminal states are completed, failed, and rejected.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Rejected,
    Reviewing,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Reviewing => "reviewing",
        };
        write!(f, "{}", s)
    }
}

/// Which stream an output line arrived on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    System,
}

/// One captured line of agent output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
    pub at: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(stream: OutputStream, line: impl Into<String>) -> Self {
        Self {
            stream,
            line: line.into(),
            at: Utc::now(),
        }
    }
}

/// Allow/deny glob lists constraining which files an agent may touch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileScope {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl FileScope {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// A single agent invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub project: String,
    pub title: String,
    pub briefing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default)]
    pub scope: FileScope,
    #[serde(default)]
    pub status: TaskState,
    #[serde(default)]
    pub output: Vec<OutputLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with a fresh ID and creation timestamp.
    pub fn new(
        owner: impl Into<String>,
        project: impl Into<String>,
        title: impl Into<String>,
        briefing: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::ids::new_id(),
            owner: owner.into(),
            project: project.into(),
            title: title.into(),
            briefing: briefing.into(),
            role: None,
            model: None,
            agent: AgentKind::default(),
            scope: FileScope::default(),
            status: TaskState::Pending,
            output: Vec::new(),
            diff: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Fields a partial task update may touch. Everything else is owned by the
/// runner while the task is live.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub briefing: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub status: Option<TaskState>,
    pub diff: Option<String>,
    pub failure_reason: Option<String>,
}
