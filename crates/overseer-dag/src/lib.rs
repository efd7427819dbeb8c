//! Overseer DAG - Plan persistence, dependency-driven execution, and planning

pub mod executor;
pub mod planner;
pub mod store;
pub mod types;

pub use executor::DagExecutor;
pub use planner::{PlanRequest, PlannedEdge, PlannedNode, PlannerClient, PlannerOutput};
pub use store::DagStore;
pub use types::{
    ApprovalMode, Dag, DagCreator, DagEdge, DagNode, DagState, GateCondition, NodeKind, NodeState,
};
