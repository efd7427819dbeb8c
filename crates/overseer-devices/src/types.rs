//! Device and device-task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Pending,
    Online,
    Offline,
    Error,
}

/// Tunnel metadata advertised by a connected device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub hostname: String,
    /// Opaque credential; forwarded, never interpreted.
    pub credential: String,
}

/// A long-lived remote worker that pulls work from its inbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Single-use onboarding credential; only the hash is at rest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceToken {
    pub token_hash: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl DeviceTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of work queued for a specific device, paired with a parent task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceTask {
    pub id: String,
    pub task_id: String,
    pub device_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub state: DeviceTaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
