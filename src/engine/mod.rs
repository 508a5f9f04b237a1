//! # Execution Engine
//!
//! Per-workflow execution state on the master: the transition table, one
//! serialized event loop per workflow instance, dispatch with retry, and
//! failover when workers or masters disappear.

pub mod dao;
pub mod dispatch_loop;
pub mod errors;
pub mod event;
pub mod failover;
pub mod repository;
pub mod runnable;
pub mod state;
pub mod state_machine;
pub mod task_instance;
pub mod workflow;
pub mod workflow_engine;

pub use dao::{InMemoryInstanceDao, InstanceDao};
pub use dispatch_loop::TaskDispatchLoop;
pub use errors::{
    DaoError, DaoResult, EngineError, EngineResult, StateMachineError, StateMachineResult,
};
pub use event::{ControlCommand, TaskEvent, WorkflowEvent};
pub use failover::{MasterFailoverCoordinator, WorkerFailoverListener};
pub use repository::WorkflowRunnableRepository;
pub use runnable::{
    RunnableContext, TaskKiller, WorkerLiveness, WorkflowExecutionRunnable, WorkflowHandle,
    WorkflowSnapshot,
};
pub use state::ExecutionStatus;
pub use state_machine::determine_target_state;
pub use task_instance::TaskInstance;
pub use workflow::{TaskDefinition, TimeoutStrategy, WorkflowDefinition, WorkflowInstance};
pub use workflow_engine::WorkflowEngine;
