use dashmap::DashMap;
use tracing::{debug, warn};

use super::errors::{EngineError, EngineResult};
use super::event::WorkflowEvent;
use super::runnable::{WorkflowHandle, WorkflowSnapshot};
use super::state::ExecutionStatus;
use super::task_instance::TaskInstance;
use crate::dispatch::host::Host;

/// Runnables currently owned by this master, keyed by workflow instance id
#[derive(Default)]
pub struct WorkflowRunnableRepository {
    runnables: DashMap<i64, WorkflowHandle>,
}

impl WorkflowRunnableRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: WorkflowHandle) -> EngineResult<()> {
        let id = handle.workflow_instance_id();
        match self.runnables.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyRunning(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, workflow_instance_id: i64) -> Option<WorkflowHandle> {
        self.runnables
            .get(&workflow_instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, workflow_instance_id: i64) -> Option<WorkflowHandle> {
        self.runnables
            .remove(&workflow_instance_id)
            .map(|(_, handle)| handle)
    }

    pub fn contains(&self, workflow_instance_id: i64) -> bool {
        self.runnables.contains_key(&workflow_instance_id)
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }

    /// Route an event to the runnable owning `workflow_instance_id`
    pub async fn post(&self, workflow_instance_id: i64, event: WorkflowEvent) -> EngineResult<()> {
        let handle = self
            .get(workflow_instance_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_instance_id))?;
        handle.post(event).await
    }

    /// Snapshots ordered by workflow instance id
    pub fn snapshots(&self) -> Vec<WorkflowSnapshot> {
        let mut snapshots: Vec<WorkflowSnapshot> = self
            .runnables
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.workflow_instance_id);
        snapshots
    }

    /// Task instances still waiting for a worker to accept them
    pub fn dispatching_tasks(&self) -> Vec<TaskInstance> {
        self.snapshots()
            .into_iter()
            .flat_map(|snapshot| snapshot.tasks)
            .filter(|task| {
                matches!(
                    task.state,
                    ExecutionStatus::SubmittedSuccess | ExecutionStatus::Dispatch
                )
            })
            .collect()
    }

    /// Queue a node-down event to every live runnable.
    ///
    /// Published snapshots lag the runnable by one save, so they cannot tell
    /// which workflows have a task on `host`. Each runnable decides for itself
    /// and ignores hosts it has nothing on. Returns the number of runnables
    /// notified.
    pub async fn broadcast_node_down(&self, host: &Host) -> usize {
        // Collect first so no map guard is held across an await
        let handles: Vec<WorkflowHandle> = self
            .runnables
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut notified = 0;
        for handle in handles {
            match handle.post(WorkflowEvent::NodeDown { host: host.clone() }).await {
                Ok(()) => notified += 1,
                Err(e) => warn!(
                    workflow_instance_id = handle.workflow_instance_id(),
                    error = %e,
                    "Could not deliver node-down event"
                ),
            }
        }
        debug!(host = %host, notified = notified, "Broadcast node down");
        notified
    }
}
