//! Overseer Devices - Remote worker registry and per-device task queue

pub mod queue;
pub mod registry;
pub mod types;

pub use queue::{DeviceTaskQueue, DEVICE_WAIT_TIMEOUT};
pub use registry::{DeviceRegistry, HEARTBEAT_TIMEOUT, SWEEP_INTERVAL};
pub use types::{Device, DeviceState, DeviceTask, DeviceTaskState, TunnelInfo};
