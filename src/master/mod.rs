//! # Master
//!
//! Master node: owns workflow runnables, dispatches their tasks to workers
//! and takes over workflows of masters that die.

pub mod killer;
pub mod processors;
pub mod server;

pub use killer::RemoteTaskKiller;
pub use processors::{TaskExecuteResultProcessor, TaskExecuteRunningProcessor};
pub use server::MasterServer;
