//! # shoal SDK
//!
//! Client for the shoal agent API: submit DAGs, follow their progress stage
//! by stage and steer them with operator commands.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shoal_sdk::{ConsoleProgress, DagHandler, ShoalClient, ShoalResult};
//! use shoal_sdk::{AgentInfo, DagSpec, NodeSpec, TaskSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ShoalResult<()> {
//!     let client = ShoalClient::builder()
//!         .base_url("http://127.0.0.1:2886")
//!         .build()?;
//!
//!     let agent = AgentInfo::new("127.0.0.1", 2886);
//!     let spec = DagSpec::new("Warm up").node(
//!         NodeSpec::new("Wait").task(TaskSpec::new("wait", "wait", agent).param("seconds", 2)),
//!     );
//!     let dag = client.dags().submit(&spec).await?;
//!
//!     DagHandler::new(client, &dag)
//!         .reporter(Arc::new(ConsoleProgress::new()))
//!         .watch()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod dag_handler;
pub mod error;
pub mod progress;
pub mod transport;

// Re-export main client
pub use client::{ShoalClient, ShoalClientBuilder};
pub use config::{ClientConfig, RetryConfig};
pub use dag_handler::DagHandler;
pub use error::{ShoalError, ShoalResult};
pub use progress::{ConsoleProgress, ProgressReporter, SilentProgress};

// Re-export core types for convenience
pub use shoal_core::types::{
    AgentInfo, Capabilities, Dag, DagId, DagKind, DagOperator, DagSpec, DagStatus, Node,
    NodeSpec, Task, TaskId, TaskLogEntry, TaskSpec, TaskStatus,
};

// Re-export events
pub use shoal_core::events::{Event, EventType};
