//! Overseer Hgmem - Hypergraph working memory for iterative retrieval

pub mod engine;
pub mod graph;
pub mod session;

pub use engine::{EngineConfig, MemoryEngine, StepOutcome};
pub use graph::{Hyperedge, HyperedgeOrigin, Hypergraph, Vertex};
pub use session::{Session, SessionState, SessionStore, SubqueryRecord};
