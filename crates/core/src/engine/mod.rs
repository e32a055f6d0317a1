pub mod dag;
pub mod dispatch;
pub mod executor;
pub mod registry;
pub mod task;

pub use dag::DagBuilder;
pub use dispatch::{AgentDispatcher, LocalDispatcher};
pub use executor::DagExecutor;
pub use registry::{OperationRegistry, RegistryBuilder, TaskInstance};
pub use task::{
    DispatchRequest, LogSink, Operation, StoreLogSink, TaskLogger, TaskOutcome, TaskRun, TaskRunner,
};
