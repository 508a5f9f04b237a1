//! # Dispatch Views
//!
//! Read-only views over the workflows this master is executing.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::engine::runnable::WorkflowSnapshot;
use crate::engine::state::ExecutionStatus;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct DispatchingTask {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub name: String,
    pub kind: String,
    pub state: ExecutionStatus,
    pub host: Option<String>,
    pub generation: u32,
    pub failover_times: u32,
    pub submit_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub workflow_instance_id: i64,
    pub name: String,
    pub state: ExecutionStatus,
    pub host: String,
    pub start_time: Option<DateTime<Utc>>,
    pub task_counts: BTreeMap<String, usize>,
}

/// GET /dispatch/tasks
pub async fn list_dispatching_tasks(State(state): State<AppState>) -> Json<Vec<DispatchingTask>> {
    let tasks = state
        .repository
        .dispatching_tasks()
        .into_iter()
        .map(|task| DispatchingTask {
            task_instance_id: task.id,
            workflow_instance_id: task.workflow_instance_id,
            name: task.name,
            kind: task.kind,
            state: task.state,
            host: task.host.map(|host| host.key()),
            generation: task.generation,
            failover_times: task.failover_times,
            submit_time: task.submit_time,
        })
        .collect();
    Json(tasks)
}

/// GET /dispatch/workflows
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowSummary>> {
    let workflows = state
        .repository
        .snapshots()
        .into_iter()
        .map(|snapshot| WorkflowSummary {
            workflow_instance_id: snapshot.workflow_instance_id,
            task_counts: snapshot.task_counts(),
            name: snapshot.name,
            state: snapshot.state,
            host: snapshot.host,
            start_time: snapshot.start_time,
        })
        .collect();
    Json(workflows)
}

/// GET /dispatch/workflows/:id
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_instance_id): Path<i64>,
) -> ApiResult<Json<WorkflowSnapshot>> {
    debug!(workflow_instance_id = workflow_instance_id, "Workflow snapshot requested");
    state
        .repository
        .get(workflow_instance_id)
        .map(|handle| Json(handle.snapshot()))
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "workflow instance {workflow_instance_id} is not executing on this master"
            ))
        })
}
