//! Request/response correlation over real sockets

use async_trait::async_trait;
use bytes::Bytes;
use dagflow_core::config::RemotingConfig;
use dagflow_core::dispatch::Host;
use dagflow_core::remote::{
    Command, CommandProcessor, CommandType, ConnectionContext, PeerInfo, PingProcessor,
    ProcessorError, ProcessorRegistry, RemotingClient, RemotingError, RemotingServer,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Accepts kill requests and never answers them
struct FailingKillProcessor;

#[async_trait]
impl CommandProcessor for FailingKillProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskKillRequest
    }

    async fn process(
        &self,
        _command: Command,
        _peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        Err(ProcessorError::failed("no such task"))
    }

    fn processor_name(&self) -> &str {
        "failing_kill"
    }
}

fn client() -> RemotingClient {
    let config = RemotingConfig {
        connect_timeout_ms: 500,
        future_reaper_interval_ms: 50,
        ..RemotingConfig::default()
    };
    let context = Arc::new(ConnectionContext::new(
        &config,
        Arc::new(ProcessorRegistry::new()),
    ));
    RemotingClient::new(config, context)
}

async fn ping_server() -> (RemotingServer, Host) {
    let processors = Arc::new(ProcessorRegistry::new());
    processors.register(Arc::new(PingProcessor));
    processors.register(Arc::new(FailingKillProcessor));
    let context = Arc::new(ConnectionContext::new(
        &RemotingConfig::default(),
        processors,
    ));
    let server = RemotingServer::new("127.0.0.1:0", context);
    let bound = server.start().await.unwrap();
    (server, Host::new("127.0.0.1", bound.port()))
}

/// A peer that accepts connections and never writes a byte
async fn silent_host() -> Host {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });
    Host::new("127.0.0.1", port)
}

#[tokio::test]
async fn test_send_sync_returns_the_matching_reply() {
    let (server, host) = ping_server().await;
    let client = client();

    let request = Command::new(CommandType::Ping, Bytes::from_static(b"are you there"));
    let opaque = request.opaque();
    let reply = client
        .send_sync(&host, request, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(reply.command_type(), CommandType::Pong);
    assert_eq!(reply.opaque(), opaque);
    assert_eq!(reply.body().as_ref(), b"are you there");
    assert!(client.is_connected(&host));
    assert!(client.futures().is_empty());

    client.close();
    server.stop();
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated_by_opaque_id() {
    let (server, host) = ping_server().await;
    let client = Arc::new(client());

    let requests = (0..64).map(|n| {
        let client = Arc::clone(&client);
        let host = host.clone();
        tokio::spawn(async move {
            let body = format!("request-{n}");
            let request = Command::new(CommandType::Ping, body.clone().into_bytes());
            let opaque = request.opaque();
            let reply = client
                .send_sync(&host, request, Duration::from_secs(2))
                .await
                .unwrap();
            (opaque, body, reply)
        })
    });

    for joined in futures::future::join_all(requests).await {
        let (opaque, body, reply) = joined.unwrap();
        assert_eq!(reply.opaque(), opaque);
        assert_eq!(reply.body().as_ref(), body.as_bytes());
    }
    assert!(client.futures().is_empty());

    client.close();
    server.stop();
}

#[tokio::test]
async fn test_silent_host_times_out_and_leaves_no_pending_future() {
    let host = silent_host().await;
    let client = client();
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let result = client
        .send_sync(
            &host,
            Command::new(CommandType::Ping, Bytes::new()),
            timeout,
        )
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RemotingError::Timeout { .. })), "{result:?}");
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(400), "took {elapsed:?}");
    assert!(client.futures().is_empty());
    client.close();
}

#[tokio::test]
async fn test_failed_processor_produces_no_reply() {
    let (server, host) = ping_server().await;
    let client = client();

    let result = client
        .send_sync(
            &host,
            Command::new(CommandType::TaskKillRequest, Bytes::from_static(b"{}")),
            Duration::from_millis(150),
        )
        .await;

    assert!(result.unwrap_err().is_timeout());
    assert!(client.futures().is_empty());

    // The connection survives a failed handler
    let reply = client
        .send_sync(
            &host,
            Command::new(CommandType::Ping, Bytes::new()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(reply.command_type(), CommandType::Pong);

    client.close();
    server.stop();
}

#[tokio::test]
async fn test_unreachable_host_fails_to_connect() {
    // Bind then drop to find a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = client();

    let error = client
        .send_sync(
            &Host::new("127.0.0.1", port),
            Command::new(CommandType::Ping, Bytes::new()),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, RemotingError::ConnectFailed { .. }), "{error:?}");
    assert!(error.is_transient());
    assert!(client.futures().is_empty());
}

#[tokio::test]
async fn test_stopped_server_drops_the_cached_connection() {
    let (server, host) = ping_server().await;
    let client = client();

    client
        .send_sync(
            &host,
            Command::new(CommandType::Ping, Bytes::new()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    server.stop();

    let result = client
        .send_sync(
            &host,
            Command::new(CommandType::Ping, Bytes::new()),
            Duration::from_millis(300),
        )
        .await;
    assert!(result.is_err());
    assert!(client.futures().is_empty());
}

#[tokio::test]
async fn test_dial_locks_are_released_with_their_connections() {
    let (server, host) = ping_server().await;
    let client = client();
    let ping = || Command::new(CommandType::Ping, Bytes::new());

    client.send_sync(&host, ping(), Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.dial_lock_count(), 1);
    client.disconnect(&host);
    assert_eq!(client.dial_lock_count(), 0);

    // Evicted when the peer goes away
    client.send_sync(&host, ping(), Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.dial_lock_count(), 1);
    server.stop();
    let deadline = Instant::now() + Duration::from_secs(2);
    while client.dial_lock_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.dial_lock_count(), 0);
    assert!(!client.is_connected(&host));

    // A failed dial leaves nothing behind either
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    assert!(client
        .send_sync(&Host::new("127.0.0.1", port), ping(), Duration::from_secs(1))
        .await
        .is_err());
    assert_eq!(client.dial_lock_count(), 0);
    client.close();
}
