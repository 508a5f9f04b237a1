//! # Web
//!
//! Read-only HTTP views served by a master: liveness and what is currently
//! being dispatched and executed.

pub mod errors;
pub mod handlers;
pub mod state;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use errors::{ApiError, ApiResult};
pub use state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::basic_health))
        .route(
            "/dispatch/tasks",
            get(handlers::dispatch::list_dispatching_tasks),
        )
        .route("/dispatch/workflows", get(handlers::dispatch::list_workflows))
        .route(
            "/dispatch/workflows/:id",
            get(handlers::dispatch::get_workflow),
        )
        .with_state(state)
}

/// Serve the router on an already bound listener until shutdown is signalled
pub fn spawn_web_server(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let router = create_router(state);
    tokio::spawn(async move {
        let address = listener.local_addr().ok();
        info!(address = ?address, "Dispatch HTTP views listening");
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "Dispatch HTTP server failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::dispatcher::ExecutorDispatcher;
    use crate::dispatch::host::Host;
    use crate::dispatch::selector::RoundRobinSelector;
    use crate::engine::dao::InMemoryInstanceDao;
    use crate::engine::dispatch_loop::TaskDispatchLoop;
    use crate::engine::repository::WorkflowRunnableRepository;
    use crate::engine::runnable::{
        RunnableContext, TaskKiller, WorkerLiveness, WorkflowExecutionRunnable,
    };
    use crate::engine::workflow::{TaskDefinition, WorkflowDefinition, WorkflowInstance};
    use crate::registry::node_manager::ServerNodeManager;
    use crate::registry::store::InMemoryRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoKill;

    #[async_trait]
    impl TaskKiller for NoKill {
        async fn kill(&self, _host: &Host, _task_instance_id: i64) {}
    }

    struct AllAlive;

    impl WorkerLiveness for AllAlive {
        fn is_worker_alive(&self, _host: &Host) -> bool {
            true
        }
    }

    fn app_state() -> AppState {
        let repository = Arc::new(WorkflowRunnableRepository::new());
        let nodes = Arc::new(ServerNodeManager::new(
            Arc::new(InMemoryRegistry::new()),
            None,
            Duration::ZERO,
        ));
        AppState::new(repository, nodes, "127.0.0.1:5678")
    }

    fn register_workflow(state: &AppState, id: i64) {
        let dispatcher = Arc::new(ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new())));
        let context = Arc::new(RunnableContext {
            dao: Arc::new(InMemoryInstanceDao::new()),
            dispatch_loop: Arc::new(TaskDispatchLoop::new(dispatcher, &DispatchConfig::default())),
            killer: Arc::new(NoKill),
            liveness: Arc::new(AllAlive),
            max_failover_times: 1,
            event_queue_size: 8,
        });
        let definition = WorkflowDefinition::new(1, "etl", vec![TaskDefinition::new(1, "a", "noop")]);
        let instance = WorkflowInstance::new(id, definition, "127.0.0.1:5678");
        let (_runnable, handle, _receiver) = WorkflowExecutionRunnable::new(instance, context);
        state.repository.insert(handle).unwrap();
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(create_router(app_state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running_workflows"], 0);
    }

    #[tokio::test]
    async fn test_workflow_views() {
        let state = app_state();
        register_workflow(&state, 42);

        let (status, body) = get(create_router(state.clone()), "/dispatch/workflows").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["workflow_instance_id"], 42);
        assert_eq!(body[0]["name"], "etl");

        let (status, body) = get(create_router(state.clone()), "/dispatch/workflows/42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "submitted_success");

        let (status, body) = get(create_router(state), "/dispatch/tasks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_404() {
        let (status, body) = get(create_router(app_state()), "/dispatch/workflows/7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
}
