//! # Workflow Engine
//!
//! Entry point for starting, recovering and controlling workflow instances on
//! a master. Each instance gets its own [`WorkflowExecutionRunnable`] task; the
//! engine only routes to it through the [`WorkflowRunnableRepository`].

use std::sync::Arc;
use tracing::info;

use super::errors::{EngineError, EngineResult};
use super::event::{ControlCommand, WorkflowEvent};
use super::repository::WorkflowRunnableRepository;
use super::runnable::{RunnableContext, WorkflowExecutionRunnable, WorkflowHandle, WorkflowSnapshot};
use super::workflow::{WorkflowDefinition, WorkflowInstance};

pub struct WorkflowEngine {
    context: Arc<RunnableContext>,
    repository: Arc<WorkflowRunnableRepository>,
    /// `host:port` recorded as owner of the instances this engine creates
    owner: String,
}

impl WorkflowEngine {
    pub fn new(
        context: Arc<RunnableContext>,
        repository: Arc<WorkflowRunnableRepository>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            context,
            repository,
            owner: owner.into(),
        }
    }

    pub fn repository(&self) -> &Arc<WorkflowRunnableRepository> {
        &self.repository
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Validate, persist and start a new workflow instance
    pub async fn submit(&self, definition: WorkflowDefinition) -> EngineResult<WorkflowHandle> {
        definition.validate()?;
        let instance = self
            .context
            .dao
            .create_workflow_instance(&definition, &self.owner)
            .await?;
        info!(
            workflow_instance_id = instance.id,
            name = %definition.name,
            tasks = definition.tasks.len(),
            "Submitting workflow instance"
        );
        self.launch(instance).await
    }

    /// Take over an instance left behind by another master (or by a previous
    /// run of this one) and resume it
    pub async fn recover(&self, mut instance: WorkflowInstance) -> EngineResult<WorkflowHandle> {
        if self.repository.contains(instance.id) {
            return Err(EngineError::AlreadyRunning(instance.id));
        }
        instance.host = self.owner.clone();
        self.context.dao.save_workflow_instance(&instance).await?;
        info!(
            workflow_instance_id = instance.id,
            state = %instance.state,
            "Recovering workflow instance"
        );
        self.launch(instance).await
    }

    pub async fn control(
        &self,
        workflow_instance_id: i64,
        command: ControlCommand,
    ) -> EngineResult<()> {
        self.repository
            .post(workflow_instance_id, WorkflowEvent::Control(command))
            .await
    }

    pub fn snapshot(&self, workflow_instance_id: i64) -> Option<WorkflowSnapshot> {
        self.repository
            .get(workflow_instance_id)
            .map(|handle| handle.snapshot())
    }

    pub fn snapshots(&self) -> Vec<WorkflowSnapshot> {
        self.repository.snapshots()
    }

    async fn launch(&self, instance: WorkflowInstance) -> EngineResult<WorkflowHandle> {
        let id = instance.id;
        let (runnable, handle, receiver) =
            WorkflowExecutionRunnable::new(instance, Arc::clone(&self.context));
        self.repository.insert(handle.clone())?;

        let repository = Arc::clone(&self.repository);
        tokio::spawn(async move {
            let finished = runnable.run(receiver).await;
            repository.remove(finished.id);
        });

        if let Err(e) = handle.post(WorkflowEvent::Start).await {
            self.repository.remove(id);
            return Err(e);
        }
        Ok(handle)
    }
}
