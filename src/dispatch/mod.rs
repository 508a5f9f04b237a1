//! # Dispatch
//!
//! Host selection and the executor dispatcher that sends a task instance to a
//! live worker.

pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod host;
pub mod manager;
pub mod selector;

pub use context::{ExecutionContext, ExecutorType};
pub use dispatcher::ExecutorDispatcher;
pub use errors::DispatchError;
pub use host::{Host, HostWeight};
pub use manager::{ExecutorManager, RemoteExecutorManager};
pub use selector::{HostSelector, LowerWeightSelector, RoundRobinSelector, SelectorKind};
