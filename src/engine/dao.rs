//! Data access contract for workflow instances

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::errors::{DaoError, DaoResult};
use super::workflow::{WorkflowDefinition, WorkflowInstance};

#[async_trait]
pub trait InstanceDao: Send + Sync {
    /// Allocate an id and store a new instance owned by `owner`
    async fn create_workflow_instance(
        &self,
        definition: &WorkflowDefinition,
        owner: &str,
    ) -> DaoResult<WorkflowInstance>;

    async fn next_task_instance_id(&self) -> DaoResult<i64>;

    async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> DaoResult<()>;

    async fn find_workflow_instance(&self, id: i64) -> DaoResult<Option<WorkflowInstance>>;

    /// Non-terminal instances owned by the master at `owner`
    async fn find_unfinished_by_host(&self, owner: &str) -> DaoResult<Vec<WorkflowInstance>>;
}

/// Process-local store for tests and single-node runs
#[derive(Debug)]
pub struct InMemoryInstanceDao {
    instances: DashMap<i64, WorkflowInstance>,
    next_workflow_id: AtomicI64,
    next_task_id: AtomicI64,
}

impl Default for InMemoryInstanceDao {
    fn default() -> Self {
        Self {
            instances: DashMap::new(),
            next_workflow_id: AtomicI64::new(1),
            next_task_id: AtomicI64::new(1),
        }
    }
}

impl InMemoryInstanceDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceDao for InMemoryInstanceDao {
    async fn create_workflow_instance(
        &self,
        definition: &WorkflowDefinition,
        owner: &str,
    ) -> DaoResult<WorkflowInstance> {
        let id = self.next_workflow_id.fetch_add(1, Ordering::Relaxed);
        let instance = WorkflowInstance::new(id, definition.clone(), owner);
        self.instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn next_task_instance_id(&self) -> DaoResult<i64> {
        Ok(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> DaoResult<()> {
        match self.instances.get_mut(&instance.id) {
            Some(mut stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(DaoError::WorkflowInstanceNotFound(instance.id)),
        }
    }

    async fn find_workflow_instance(&self, id: i64) -> DaoResult<Option<WorkflowInstance>> {
        Ok(self.instances.get(&id).map(|stored| stored.clone()))
    }

    async fn find_unfinished_by_host(&self, owner: &str) -> DaoResult<Vec<WorkflowInstance>> {
        let mut found: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| entry.host == owner && !entry.state.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|instance| instance.id);
        Ok(found)
    }
}
