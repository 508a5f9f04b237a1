//! Request/response correlation
//!
//! Every synchronous request registers a [`ResponseFuture`] under its opaque id
//! before the command is written, tagged with the connection that carries it. The entry is removed exactly once, by whichever
//! of {reply arrival, caller timeout, reaper} gets to it first; `DashMap::remove`
//! is the single arbitration point, so completion and timeout can race freely.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::command::Command;
use super::errors::RemotingError;

pub type ResponseResult = Result<Command, RemotingError>;

/// A pending request awaiting its reply
#[derive(Debug)]
pub struct ResponseFuture {
    opaque: i64,
    host: String,
    connection_id: String,
    begin: Instant,
    timeout: Duration,
    sender: oneshot::Sender<ResponseResult>,
}

impl ResponseFuture {
    pub fn opaque(&self) -> i64 {
        self.opaque
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn elapsed(&self) -> Duration {
        self.begin.elapsed()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.begin) > self.timeout
    }

    fn resolve(self, result: ResponseResult) {
        // The waiter may already be gone (dropped its await); nothing to wake then.
        let _ = self.sender.send(result);
    }
}

/// Receiver half handed to the caller of a synchronous request
pub type ResponseLatch = oneshot::Receiver<ResponseResult>;

/// Pending futures keyed by opaque id.
///
/// Constructed once per node and shared (behind an `Arc`) by the client, the
/// connections it owns and the reaper.
#[derive(Debug, Default)]
pub struct ResponseFutureTable {
    pending: DashMap<i64, ResponseFuture>,
}

impl ResponseFutureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a future for `opaque` sent over `connection_id`; fails if one
    /// is already outstanding
    pub fn register(
        &self,
        opaque: i64,
        host: impl Into<String>,
        connection_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<ResponseLatch, RemotingError> {
        match self.pending.entry(opaque) {
            Entry::Occupied(_) => Err(RemotingError::DuplicateOpaque(opaque)),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                vacant.insert(ResponseFuture {
                    opaque,
                    host: host.into(),
                    connection_id: connection_id.into(),
                    begin: Instant::now(),
                    timeout,
                    sender,
                });
                Ok(receiver)
            }
        }
    }

    /// Complete the future matching the reply's opaque id.
    ///
    /// Returns false for a stale reply (no future registered), which is dropped.
    pub fn complete(&self, reply: Command) -> bool {
        match self.pending.remove(&reply.opaque()) {
            Some((_, future)) => {
                trace!(
                    opaque = reply.opaque(),
                    elapsed_ms = future.elapsed().as_millis() as u64,
                    "Response future completed"
                );
                future.resolve(Ok(reply));
                true
            }
            None => {
                debug!(
                    opaque = reply.opaque(),
                    command_type = %reply.command_type(),
                    "Dropping reply with no pending request"
                );
                false
            }
        }
    }

    /// Fail a single pending future
    pub fn fail(&self, opaque: i64, error: RemotingError) -> bool {
        match self.pending.remove(&opaque) {
            Some((_, future)) => {
                future.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove a future whose caller gave up waiting
    pub fn remove(&self, opaque: i64) -> bool {
        self.pending.remove(&opaque).is_some()
    }

    /// Fail every future sent over `connection_id`, used when it drops.
    ///
    /// Requests to the same host on a newer connection are left alone.
    pub fn fail_connection(&self, connection_id: &str) -> usize {
        let opaques: Vec<i64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for opaque in opaques {
            if let Some((_, future)) = self
                .pending
                .remove_if(&opaque, |_, future| future.connection_id == connection_id)
            {
                let error = RemotingError::ConnectionClosed {
                    host: future.host.clone(),
                };
                future.resolve(Err(error));
                failed += 1;
            }
        }
        failed
    }

    /// Retire every expired future with a timeout cause
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for opaque in expired {
            if let Some((_, future)) = self
                .pending
                .remove_if(&opaque, |_, future| future.is_expired(now))
            {
                let error = RemotingError::Timeout {
                    host: future.host.clone(),
                    opaque,
                    timeout: future.timeout,
                };
                future.resolve(Err(error));
                reaped += 1;
            }
        }

        if reaped > 0 {
            warn!(reaped = reaped, "Reaped expired response futures");
        }
        reaped
    }

    pub fn contains(&self, opaque: i64) -> bool {
        self.pending.contains_key(&opaque)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run [`Self::reap_expired`] on an interval until shutdown is signalled
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap_expired();
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Response future reaper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
