// Core of the shoal agent: staged DAG engine, persistence and audit journal

pub mod engine;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use types::*;
