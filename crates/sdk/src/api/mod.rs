//! Typed groups of agent API endpoints.

pub mod agent;
pub mod dags;
pub mod health;
pub mod operations;

pub use agent::AgentApi;
pub use dags::DagsApi;
pub use health::{HealthApi, HealthCheck};
pub use operations::{OperationInfo, OperationsApi};
