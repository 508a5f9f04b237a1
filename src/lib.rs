#![allow(clippy::doc_markdown)] // Allow technical terms like ZooKeeper, etcd in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dagflow Core
//!
//! Distributed dispatch and execution-state engine of a DAG workflow
//! orchestrator.
//!
//! ## Overview
//!
//! Users submit directed-acyclic workflows whose tasks execute on a cluster of
//! worker nodes, coordinated by one or more master nodes. This crate holds the
//! parts that make that distributed: the RPC transport between nodes, host
//! selection and dispatch, the per-workflow execution state machine, and the
//! registry-based liveness that drives failover.
//!
//! ## Module Organization
//!
//! - [`remote`] - binary command protocol, request/response correlation, client and server
//! - [`registry`] - leases, ephemeral node entries, heartbeats and the live-host cache
//! - [`dispatch`] - host selection and the executor dispatcher
//! - [`engine`] - workflow runnables, task state machine, failover
//! - [`master`] / [`worker`] - node bootstrap and RPC processors per role
//! - [`web`] - read-only HTTP views of what a master is dispatching
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging setup
//! - [`error`] - crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dagflow_core::config::DagflowConfig;
//! use dagflow_core::engine::{InMemoryInstanceDao, TaskDefinition, WorkflowDefinition};
//! use dagflow_core::master::MasterServer;
//! use dagflow_core::registry::{InMemoryRegistry, SystemResourceProbe};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let master = MasterServer::start(
//!     DagflowConfig::default(),
//!     Arc::new(InMemoryRegistry::new()),
//!     Arc::new(InMemoryInstanceDao::new()),
//!     Arc::new(SystemResourceProbe::new()),
//! )
//! .await?;
//!
//! let definition = WorkflowDefinition::new(
//!     1,
//!     "nightly",
//!     vec![
//!         TaskDefinition::new(1, "extract", "shell"),
//!         TaskDefinition::new(2, "load", "shell").with_pre_tasks([1]),
//!     ],
//! );
//! let handle = master.engine().submit(definition).await?;
//! let state = handle.wait_for_state(|state| state.is_terminal()).await;
//! println!("workflow finished: {state}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod master;
pub mod registry;
pub mod remote;
pub mod web;
pub mod worker;

pub use config::{ConfigLoader, DagflowConfig};
pub use error::{DagflowError, Result};
pub use master::MasterServer;
pub use worker::WorkerServer;
