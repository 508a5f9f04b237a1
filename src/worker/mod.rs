//! # Worker
//!
//! Worker node: accepts dispatched task instances, runs them through task
//! plugins and reports progress to the dispatching master.

pub mod errors;
pub mod executor;
pub mod message_retry;
pub mod plugin;
pub mod processors;
pub mod server;

pub use errors::{TaskError, TaskResult};
pub use executor::WorkerTaskExecutor;
pub use message_retry::{MasterLiveness, MessageRetryRunner, TaskReport};
pub use plugin::{
    NoopTaskPlugin, RunnableTask, ShellTaskPlugin, TaskExecution, TaskKind, TaskPlugin,
    TaskPluginRegistry,
};
pub use processors::{TaskDispatchProcessor, TaskKillProcessor};
pub use server::WorkerServer;
