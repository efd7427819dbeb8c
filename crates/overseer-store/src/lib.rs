//! Overseer Store - File-backed durable state: tasks, roles, encrypted config

pub mod roles;
pub mod secrets;
pub mod state;
pub mod tasks;

pub use roles::{Role, RoleRegistry, DEFAULT_ROLE};
pub use secrets::{ConfigStore, MaskedEntry};
pub use state::JsonState;
pub use tasks::TaskStore;
