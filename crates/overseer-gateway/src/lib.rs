//! Overseer Gateway - HTTP/WebSocket surface over the orchestration core

pub mod error;
pub mod server;
pub mod state;
pub mod ws;

pub use server::build_router;
pub use state::{AppConfig, AppState};
