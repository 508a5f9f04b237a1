//! Shared state of the dispatch HTTP views

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::engine::repository::WorkflowRunnableRepository;
use crate::registry::node_manager::ServerNodeManager;

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<WorkflowRunnableRepository>,
    pub nodes: Arc<ServerNodeManager>,
    /// `host:port` of the master serving these views
    pub master_host: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        repository: Arc<WorkflowRunnableRepository>,
        nodes: Arc<ServerNodeManager>,
        master_host: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            nodes,
            master_host: master_host.into(),
            started_at: Utc::now(),
        }
    }
}
