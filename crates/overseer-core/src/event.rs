//! Lifecycle events and the broadcaster that fans them out to observers.
//!
//! Each component owns an explicit `Broadcaster` handle injected at wiring
//! time. Delivery is per-subscriber FIFO through a bounded buffer; the
//! producer never blocks. A subscriber that falls behind is unsubscribed and
//! the survivors are told via `subscriber:dropped`.

use crate::types::{OutputStream, TaskState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Every observable occurrence in the core. The envelope is
/// `{"type": "<kind>", ...payload}`; payloads carry enough identifiers to
/// route without side lookups.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "task:started")]
    TaskStarted {
        task_id: String,
        project: String,
        title: String,
    },
    #[serde(rename = "task:updated")]
    TaskUpdated { task_id: String, status: TaskState },
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: String },
    #[serde(rename = "task:failed")]
    TaskFailed { task_id: String, reason: String },
    #[serde(rename = "task:output")]
    TaskOutput {
        task_id: String,
        stream: OutputStream,
        line: String,
    },
    #[serde(rename = "task:model_resolved")]
    TaskModelResolved { task_id: String, model: String },
    #[serde(rename = "task:chunk")]
    TaskChunk {
        device_task_id: String,
        task_id: String,
        chunk: String,
    },

    #[serde(rename = "dag:created")]
    DagCreated {
        dag_id: String,
        name: String,
        project: String,
    },
    #[serde(rename = "dag:started")]
    DagStarted { dag_id: String },
    #[serde(rename = "dag:completed")]
    DagCompleted { dag_id: String, status: String },
    #[serde(rename = "dag:node:started")]
    DagNodeStarted {
        dag_id: String,
        node_id: String,
        title: String,
    },
    #[serde(rename = "dag:node:completed")]
    DagNodeCompleted {
        dag_id: String,
        node_id: String,
        status: String,
        artifacts: serde_json::Value,
    },
    #[serde(rename = "dag:node:failed")]
    DagNodeFailed {
        dag_id: String,
        node_id: String,
        reason: String,
    },
    #[serde(rename = "dag:node:waiting_approval")]
    DagNodeWaitingApproval { dag_id: String, node_id: String },
    #[serde(rename = "dag:node:added")]
    DagNodeAdded { dag_id: String, node_id: String },
    #[serde(rename = "dag:node:output")]
    DagNodeOutput {
        dag_id: String,
        node_id: String,
        line: String,
    },

    #[serde(rename = "device:created")]
    DeviceCreated { device_id: String, name: String },
    #[serde(rename = "device:connected")]
    DeviceConnected { device_id: String },
    #[serde(rename = "device:online")]
    DeviceOnline { device_id: String },
    #[serde(rename = "device:offline")]
    DeviceOffline { device_id: String },
    #[serde(rename = "device:deleted")]
    DeviceDeleted { device_id: String },

    #[serde(rename = "hgmem:session:created")]
    HgmemSessionCreated { session_id: String, query: String },
    #[serde(rename = "hgmem:session:completed")]
    HgmemSessionCompleted { session_id: String },
    #[serde(rename = "hgmem:step:start")]
    HgmemStepStart { session_id: String, step: u32 },
    #[serde(rename = "hgmem:step:end")]
    HgmemStepEnd { session_id: String, step: u32 },

    #[serde(rename = "subscriber:dropped")]
    SubscriberDropped { subscriber_id: String },
}

const DEFAULT_BUFFER: usize = 256;

/// Fan-out of [`Event`]s to named subscribers over bounded channels.
pub struct Broadcaster {
    capacity: usize,
    subscribers: DashMap<String, mpsc::Sender<Event>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: DashMap::new(),
        }
    }

    /// Register a subscriber and get its delivery channel. Re-subscribing
    /// under an existing ID replaces the old channel.
    pub fn subscribe(&self, id: impl Into<String>) -> mpsc::Receiver<Event> {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.insert(id.clone(), tx);
        debug!(subscriber = %id, "subscribed");
        rx
    }

    /// Register a callback subscriber. The callback runs on a dedicated
    /// delivery worker so a slow callback cannot slow the producer.
    pub fn subscribe_fn<F>(&self, id: impl Into<String>, mut callback: F)
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.subscribe(id);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        });
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver an event to every live subscriber without blocking. Subscribers
    /// with full buffers are dropped; closed receivers are pruned silently.
    pub fn broadcast(&self, event: Event) {
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => overflowed.push(entry.key().clone()),
                Err(TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            debug!(subscriber = %id, "pruned closed subscriber");
        }

        for id in overflowed {
            self.subscribers.remove(&id);
            warn!(subscriber = %id, "subscriber buffer overflow, dropping");
            let notice = Event::SubscriberDropped {
                subscriber_id: id,
            };
            for entry in self.subscribers.iter() {
                let _ = entry.value().try_send(notice.clone());
            }
        }
    }
}
