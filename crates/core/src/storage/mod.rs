pub mod dag_store;
pub mod event_log;

pub use dag_store::{DagStore, RedbDagStore};
pub use event_log::JsonlEventLog;
