//! Host selection and dispatch through the executor dispatcher

mod common;

use common::*;
use dagflow_core::config::DispatchConfig;
use dagflow_core::dispatch::{
    DispatchError, ExecutionContext, ExecutorDispatcher, ExecutorType, LowerWeightSelector,
    RoundRobinSelector,
};
use dagflow_core::engine::TaskDispatchLoop;
use dagflow_core::remote::messages::TaskExecutionContext;
use std::collections::BTreeMap;
use std::sync::Arc;

fn context(task_instance_id: i64) -> ExecutionContext {
    ExecutionContext::new(
        ExecutorType::Worker,
        TaskExecutionContext {
            task_instance_id,
            workflow_instance_id: 1,
            task_name: format!("task-{task_instance_id}"),
            task_kind: "noop".to_string(),
            params: serde_json::Value::Null,
            var_pool: BTreeMap::new(),
            worker_group: "default".to_string(),
            generation: 1,
            timeout_ms: None,
        },
    )
}

fn round_robin_dispatcher(manager: Arc<RecordingExecutorManager>) -> ExecutorDispatcher {
    let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
    dispatcher.register(manager);
    dispatcher
}

#[tokio::test]
async fn test_round_robin_cycles_through_live_hosts() {
    let manager = Arc::new(RecordingExecutorManager::with_hosts(vec![
        worker(1),
        worker(2),
        worker(3),
    ]));
    let dispatcher = round_robin_dispatcher(manager.clone());

    let mut chosen = Vec::new();
    for id in 0..6 {
        let mut ctx = context(id);
        let host = dispatcher.dispatch(&mut ctx).await.unwrap();
        assert_eq!(ctx.host.as_ref(), Some(&host));
        chosen.push(host);
    }

    assert_eq!(
        chosen,
        vec![worker(1), worker(2), worker(3), worker(1), worker(2), worker(3)]
    );
    assert_eq!(manager.dispatch_count(), 6);
}

#[tokio::test]
async fn test_empty_host_set_is_a_capacity_error() {
    let dispatcher = round_robin_dispatcher(Arc::new(RecordingExecutorManager::default()));

    let error = dispatcher.dispatch(&mut context(1)).await.unwrap_err();

    assert!(matches!(error, DispatchError::NoAvailableHost { .. }), "{error:?}");
    assert!(error.is_capacity_error());
    assert!(error.is_retryable());
}

#[tokio::test]
async fn test_missing_executor_manager_is_not_retried() {
    let dispatcher = ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new()));
    let dispatch_loop = TaskDispatchLoop::new(
        Arc::new(dispatcher),
        &DispatchConfig {
            max_task_commit_retries: 5,
            task_commit_interval_ms: 1_000,
            ..DispatchConfig::default()
        },
    );

    let started = std::time::Instant::now();
    let error = dispatch_loop.dispatch_with_retry(context(1)).await.unwrap_err();

    assert!(matches!(error, DispatchError::ExecutorManagerNotFound { .. }));
    assert!(!error.is_retryable());
    assert!(started.elapsed() < std::time::Duration::from_millis(500));
}

#[tokio::test]
async fn test_lower_weight_prefers_the_least_loaded_host() {
    let manager = Arc::new(RecordingExecutorManager::with_hosts(vec![
        worker(1).with_weight(42.0),
        worker(2).with_weight(7.5),
        worker(3).with_weight(7.5),
    ]));
    let dispatcher = ExecutorDispatcher::new(Arc::new(LowerWeightSelector));
    dispatcher.register(manager);

    for id in 0..3 {
        let host = dispatcher.dispatch(&mut context(id)).await.unwrap();
        assert_eq!(host, worker(2));
    }
    assert_eq!(dispatcher.selector_name(), "lower_weight");
}

#[tokio::test]
async fn test_dispatch_loop_retries_rejections() {
    let manager = Arc::new(RecordingExecutorManager::with_hosts(vec![worker(1)]));
    manager.reject_next(2, "busy");
    let dispatch_loop = TaskDispatchLoop::new(
        Arc::new(round_robin_dispatcher(manager.clone())),
        &DispatchConfig {
            max_task_commit_retries: 2,
            task_commit_interval_ms: 5,
            ..DispatchConfig::default()
        },
    );

    let host = dispatch_loop.dispatch_with_retry(context(9)).await.unwrap();
    assert_eq!(host, worker(1));
    assert_eq!(manager.dispatch_count(), 1);
}

#[tokio::test]
async fn test_dispatch_loop_gives_up_after_its_budget() {
    let manager = Arc::new(RecordingExecutorManager::with_hosts(vec![worker(1)]));
    manager.reject_next(3, "busy");
    let dispatch_loop = TaskDispatchLoop::new(
        Arc::new(round_robin_dispatcher(manager.clone())),
        &DispatchConfig {
            max_task_commit_retries: 2,
            task_commit_interval_ms: 5,
            ..DispatchConfig::default()
        },
    );

    let error = dispatch_loop.dispatch_with_retry(context(9)).await.unwrap_err();
    assert!(matches!(error, DispatchError::Rejected { ref reason, .. } if reason == "busy"));
    assert_eq!(manager.dispatch_count(), 0);
}
