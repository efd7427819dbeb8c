//! Device lifecycle: one-time-token onboarding, heartbeats, health sweep

use crate::types::{Device, DeviceState, DeviceToken, TunnelInfo};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use overseer_core::{Broadcaster, Error, Event, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Heartbeat silence before a device flips offline.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Cadence of the health sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// One-time token validity.
const TOKEN_TTL_HOURS: i64 = 24;
const TOKEN_PREFIX: &str = "odt_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct DeviceFile {
    devices: Vec<Device>,
    tokens: Vec<DeviceToken>,
}

pub struct DeviceRegistry {
    state: overseer_store::JsonState,
    inner: RwLock<DeviceFile>,
    broadcaster: Arc<Broadcaster>,
    offline_after: ChronoDuration,
}

fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_plaintext_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

impl DeviceRegistry {
    pub fn load(path: impl Into<PathBuf>, broadcaster: Arc<Broadcaster>) -> Self {
        let state = overseer_store::JsonState::new(path);
        let inner: DeviceFile = state.load_or_default();
        Self {
            state,
            inner: RwLock::new(inner),
            broadcaster,
            offline_after: ChronoDuration::from_std(HEARTBEAT_TIMEOUT).expect("static duration"),
        }
    }

    /// Override the heartbeat silence threshold (tests).
    pub fn with_offline_after(mut self, timeout: Duration) -> Self {
        self.offline_after = ChronoDuration::from_std(timeout).expect("valid duration");
        self
    }

    fn persist(&self, file: &DeviceFile) {
        if let Err(e) = self.state.save(file) {
            warn!(error = %e, "failed to persist devices");
        }
    }

    /// Create a device in `pending` and mint its one-time connection token.
    /// The plaintext token is returned exactly once.
    pub async fn create(
        &self,
        name: &str,
        device_type: &str,
        tags: Vec<String>,
    ) -> (Device, String) {
        let device = Device {
            id: format!("dev-{}", overseer_core::new_id()),
            name: name.to_string(),
            device_type: device_type.to_string(),
            tags,
            state: DeviceState::Pending,
            capabilities: HashMap::new(),
            hostname: None,
            tunnel: None,
            metrics: None,
            last_seen: None,
            created_at: Utc::now(),
        };
        let plaintext = new_plaintext_token();
        let token = DeviceToken {
            token_hash: hash_token(&plaintext),
            device_id: device.id.clone(),
            expires_at: Utc::now() + ChronoDuration::hours(TOKEN_TTL_HOURS),
            used_at: None,
        };

        let mut inner = self.inner.write().await;
        inner.devices.push(device.clone());
        inner.tokens.push(token);
        self.persist(&inner);
        drop(inner);

        info!(device = %device.id, name = %device.name, "device created");
        self.broadcaster.broadcast(Event::DeviceCreated {
            device_id: device.id.clone(),
            name: device.name.clone(),
        });
        (device, plaintext)
    }

    /// Redeem a one-time token. Rejects unknown, expired, and reused tokens;
    /// marking a token used is irrevocable.
    pub async fn connect(
        &self,
        token_plaintext: &str,
        capabilities: HashMap<String, serde_json::Value>,
        hostname: Option<String>,
    ) -> Result<Device> {
        let hash = hash_token(token_plaintext);
        let mut inner = self.inner.write().await;

        let token = inner
            .tokens
            .iter_mut()
            .find(|t| t.token_hash == hash)
            .ok_or_else(|| Error::unauthorized("unknown device token"))?;

        let device_id = token.device_id.clone();
        if token.used_at.is_some() {
            warn!(device = %device_id, "rejected reuse of device token");
            return Err(Error::unauthorized("device token already used"));
        }
        if token.expires_at < Utc::now() {
            warn!(device = %device_id, "rejected expired device token");
            return Err(Error::unauthorized("device token expired"));
        }
        token.used_at = Some(Utc::now());

        let device = inner
            .devices
            .iter_mut()
            .find(|d| d.id == device_id)
            .ok_or_else(|| Error::not_found("device", device_id.clone()))?;
        device.capabilities.extend(capabilities);
        device.hostname = hostname;
        device.state = DeviceState::Online;
        device.last_seen = Some(Utc::now());
        let connected = device.clone();

        self.persist(&inner);
        drop(inner);

        info!(device = %connected.id, "device connected");
        self.broadcaster.broadcast(Event::DeviceConnected {
            device_id: connected.id.clone(),
        });
        Ok(connected)
    }

    /// Record a heartbeat: bump last-seen, merge capability/metric updates,
    /// and flip an offline device back online.
    pub async fn heartbeat(
        &self,
        device_id: &str,
        capabilities: Option<HashMap<String, serde_json::Value>>,
        metrics: Option<serde_json::Value>,
    ) -> Result<Device> {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .iter_mut()
            .find(|d| d.id == device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;

        device.last_seen = Some(Utc::now());
        if let Some(caps) = capabilities {
            device.capabilities.extend(caps);
        }
        if let Some(metrics) = metrics {
            device.metrics = Some(metrics);
        }

        let came_online = device.state == DeviceState::Offline;
        if came_online {
            device.state = DeviceState::Online;
        }
        let updated = device.clone();
        self.persist(&inner);
        drop(inner);

        if came_online {
            info!(device = %device_id, "device back online");
            self.broadcaster.broadcast(Event::DeviceOnline {
                device_id: device_id.to_string(),
            });
        }
        Ok(updated)
    }

    /// One pass of the health sweep: flip silent online devices offline.
    /// Returns the IDs that transitioned.
    pub async fn sweep(&self) -> Vec<String> {
        let cutoff = Utc::now() - self.offline_after;
        let mut flipped = Vec::new();

        let mut inner = self.inner.write().await;
        for device in inner.devices.iter_mut() {
            if device.state == DeviceState::Online
                && device.last_seen.map(|seen| seen < cutoff).unwrap_or(true)
            {
                device.state = DeviceState::Offline;
                flipped.push(device.id.clone());
            }
        }
        if !flipped.is_empty() {
            self.persist(&inner);
        }
        drop(inner);

        for id in &flipped {
            warn!(device = %id, "device offline: heartbeat silence");
            self.broadcaster.broadcast(Event::DeviceOffline {
                device_id: id.clone(),
            });
        }
        flipped
    }

    /// Run the health sweep on its fixed cadence until the handle is dropped.
    pub fn spawn_health_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    pub async fn get(&self, device_id: &str) -> Result<Device> {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| Error::not_found("device", device_id))
    }

    pub async fn list(&self) -> Vec<Device> {
        self.inner.read().await.devices.clone()
    }

    pub async fn set_tunnel(&self, device_id: &str, tunnel: TunnelInfo) -> Result<Device> {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .iter_mut()
            .find(|d| d.id == device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;
        device.tunnel = Some(tunnel);
        let updated = device.clone();
        self.persist(&inner);
        Ok(updated)
    }

    pub async fn tunnel(&self, device_id: &str) -> Result<Option<TunnelInfo>> {
        Ok(self.get(device_id).await?.tunnel)
    }

    /// Remove the device and every token minted for it.
    pub async fn delete(&self, device_id: &str) -> Result<Device> {
        let mut inner = self.inner.write().await;
        let idx = inner
            .devices
            .iter()
            .position(|d| d.id == device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;
        let removed = inner.devices.remove(idx);
        inner.tokens.retain(|t| t.device_id != device_id);
        self.persist(&inner);
        drop(inner);

        info!(device = %device_id, "device deleted");
        self.broadcaster.broadcast(Event::DeviceDeleted {
            device_id: device_id.to_string(),
        });
        Ok(removed)
    }
}
