//! Overseer Core - Shared types, IDs, errors, scopes, and the event broadcaster

pub mod artifact;
pub mod error;
pub mod event;
pub mod ids;
pub mod scope;
pub mod types;

pub use artifact::ArtifactValue;
pub use error::{Error, ErrorKind, Result};
pub use event::{Broadcaster, Event};
pub use ids::new_id;
pub use scope::{check as scope_check, check_all as scope_check_all, BulkScopeResult, ScopeDecision};
pub use types::*;
