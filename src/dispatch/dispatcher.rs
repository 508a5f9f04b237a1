use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::context::{ExecutionContext, ExecutorType};
use super::errors::DispatchError;
use super::host::Host;
use super::manager::ExecutorManager;
use super::selector::HostSelector;
use crate::logging::log_dispatch_operation;

/// Routes an execution context to one host of its executor type.
///
/// A single attempt, no retries; [`crate::engine::dispatch_loop::TaskDispatchLoop`]
/// owns the retry policy.
pub struct ExecutorDispatcher {
    managers: RwLock<HashMap<ExecutorType, Arc<dyn ExecutorManager>>>,
    selector: Arc<dyn HostSelector>,
}

impl ExecutorDispatcher {
    pub fn new(selector: Arc<dyn HostSelector>) -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
            selector,
        }
    }

    pub fn register(&self, manager: Arc<dyn ExecutorManager>) {
        let executor_type = manager.executor_type();
        info!(executor_type = %executor_type, "Registered executor manager");
        self.managers.write().insert(executor_type, manager);
    }

    pub fn selector_name(&self) -> &'static str {
        self.selector.selector_name()
    }

    /// Select a host and send the context to it, returning the host on success.
    ///
    /// A host already set on the context is used as long as it is still a
    /// candidate. Otherwise the selector picks among candidates that are not
    /// excluded.
    pub async fn dispatch(&self, context: &mut ExecutionContext) -> Result<Host, DispatchError> {
        let manager = self
            .managers
            .read()
            .get(&context.executor_type)
            .cloned()
            .ok_or(DispatchError::ExecutorManagerNotFound {
                executor_type: context.executor_type,
            })?;

        let mut candidates = manager.candidate_hosts(context);
        let host = match &context.host {
            Some(pinned) => candidates
                .into_iter()
                .find(|candidate| candidate == pinned)
                .ok_or_else(|| DispatchError::UnusableHost { host: pinned.key() })?,
            None => {
                candidates.retain(|candidate| !context.excluded_hosts.contains(candidate));
                self.selector
                    .select(&candidates)
                    .ok_or_else(|| DispatchError::NoAvailableHost {
                        executor_type: context.executor_type,
                        worker_group: context.worker_group().to_string(),
                    })?
            }
        };
        if !host.is_usable() {
            return Err(DispatchError::UnusableHost { host: host.key() });
        }
        context.host = Some(host.clone());

        let result = match manager.before_execute(context).await {
            Ok(()) => manager.execute(context).await,
            Err(e) => Err(e),
        };
        manager.after_execute(context).await;

        let host_key = host.key();
        match &result {
            Ok(()) => log_dispatch_operation(
                "dispatch",
                context.task_instance_id(),
                context.worker_group(),
                Some(&host_key),
                "success",
                None,
            ),
            Err(e) => warn!(
                task_instance_id = context.task_instance_id(),
                host = %host_key,
                error = %e,
                "Dispatch attempt failed"
            ),
        }
        result.map(|()| host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::selector::RoundRobinSelector;
    use crate::remote::messages::TaskExecutionContext;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSelector {
        calls: AtomicUsize,
    }

    impl HostSelector for CountingSelector {
        fn select(&self, hosts: &[Host]) -> Option<Host> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            hosts.first().cloned()
        }

        fn selector_name(&self) -> &'static str {
            "counting"
        }
    }

    #[derive(Default)]
    struct FakeManager {
        hosts: Vec<Host>,
        fail: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ExecutorManager for FakeManager {
        fn executor_type(&self) -> ExecutorType {
            ExecutorType::Worker
        }

        fn candidate_hosts(&self, _context: &ExecutionContext) -> Vec<Host> {
            self.hosts.clone()
        }

        async fn before_execute(&self, _context: &ExecutionContext) -> Result<(), DispatchError> {
            self.calls.lock().push("before");
            Ok(())
        }

        async fn execute(&self, context: &ExecutionContext) -> Result<(), DispatchError> {
            self.calls.lock().push("execute");
            if self.fail {
                return Err(DispatchError::Rejected {
                    host: context.host.as_ref().map(Host::key).unwrap_or_default(),
                    task_instance_id: context.task_instance_id(),
                    reason: "busy".to_string(),
                });
            }
            Ok(())
        }

        async fn after_execute(&self, _context: &ExecutionContext) {
            self.calls.lock().push("after");
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutorType::Worker,
            TaskExecutionContext {
                task_instance_id: 1,
                workflow_instance_id: 1,
                task_name: "t".to_string(),
                task_kind: "noop".to_string(),
                params: serde_json::Value::Null,
                var_pool: Default::default(),
                worker_group: "default".to_string(),
                generation: 1,
                timeout_ms: None,
            },
        )
    }

    #[tokio::test]
    async fn test_unregistered_executor_type_fails_before_selection() {
        let selector = Arc::new(CountingSelector {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = ExecutorDispatcher::new(selector.clone());

        let err = dispatcher.dispatch(&mut context()).await.unwrap_err();
        assert!(matches!(err, DispatchError::ExecutorManagerNotFound { .. }));
        assert!(!err.is_retryable());
        assert_eq!(selector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_hosts_is_a_capacity_error() {
        let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
        dispatcher.register(Arc::new(FakeManager::default()));

        let err = dispatcher.dispatch(&mut context()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoAvailableHost { .. }));
        assert!(err.is_capacity_error());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unusable_host_is_not_sent_to() {
        let manager = Arc::new(FakeManager {
            hosts: vec![Host::new("", 0)],
            ..Default::default()
        });
        let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
        dispatcher.register(manager.clone());

        let err = dispatcher.dispatch(&mut context()).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnusableHost { .. }));
        assert!(manager.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_hooks_wrap_execute_even_on_failure() {
        let manager = Arc::new(FakeManager {
            hosts: vec![Host::new("10.0.0.1", 1234)],
            fail: true,
            ..Default::default()
        });
        let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
        dispatcher.register(manager.clone());

        let mut ctx = context();
        let err = dispatcher.dispatch(&mut ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { .. }));
        assert_eq!(*manager.calls.lock(), vec!["before", "execute", "after"]);
        assert_eq!(ctx.host, Some(Host::new("10.0.0.1", 1234)));
    }

    #[tokio::test]
    async fn test_pinned_host_is_used_only_while_it_is_a_candidate() {
        let manager = Arc::new(FakeManager {
            hosts: vec![Host::new("10.0.0.1", 1234), Host::new("10.0.0.2", 1234)],
            ..Default::default()
        });
        let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
        dispatcher.register(manager);

        let mut ctx = context();
        ctx.host = Some(Host::new("10.0.0.2", 1234));
        assert_eq!(dispatcher.dispatch(&mut ctx).await.unwrap().address, "10.0.0.2");

        ctx.host = Some(Host::new("10.0.0.9", 1234));
        let err = dispatcher.dispatch(&mut ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnusableHost { .. }));
    }

    #[tokio::test]
    async fn test_excluded_hosts_are_never_selected() {
        let manager = Arc::new(FakeManager {
            hosts: vec![Host::new("10.0.0.1", 1234), Host::new("10.0.0.2", 1234)],
            ..Default::default()
        });
        let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
        dispatcher.register(manager);

        let mut ctx = context();
        ctx.excluded_hosts = vec![Host::new("10.0.0.1", 1234)];
        for _ in 0..3 {
            ctx.host = None;
            assert_eq!(dispatcher.dispatch(&mut ctx).await.unwrap().address, "10.0.0.2");
        }

        ctx.host = None;
        ctx.excluded_hosts.push(Host::new("10.0.0.2", 1234));
        let err = dispatcher.dispatch(&mut ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoAvailableHost { .. }));
    }

    #[tokio::test]
    async fn test_successful_dispatch_returns_selected_host() {
        let manager = Arc::new(FakeManager {
            hosts: vec![Host::new("10.0.0.1", 1234), Host::new("10.0.0.2", 1234)],
            ..Default::default()
        });
        let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
        dispatcher.register(manager);

        let first = dispatcher.dispatch(&mut context()).await.unwrap();
        let second = dispatcher.dispatch(&mut context()).await.unwrap();
        assert_eq!(first.address, "10.0.0.1");
        assert_eq!(second.address, "10.0.0.2");
    }
}
