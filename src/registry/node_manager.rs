//! Local cache of live masters and workers
//!
//! Mirrors the registry's `/masters` and `/workers` namespaces and fans node
//! additions and removals out to [`NodeChangeListener`]s. Readers (host
//! selection, the HTTP views) never wait on the registry.
//!
//! Every listener drains its own queue on its own task, in registry order. A
//! slow listener delays only itself; the cache keeps following the registry.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::errors::RegistryResult;
use super::heartbeat::HeartBeat;
use super::paths::{self, parse_node_path, NodePath};
use super::store::{Registry, RegistryEvent};
use crate::dispatch::host::{Host, HostWeight};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeChange {
    MasterAdded(Host),
    MasterRemoved(Host),
    WorkerAdded { group: String, host: Host },
    WorkerRemoved { group: String, host: Host },
}

impl NodeChange {
    pub fn host(&self) -> &Host {
        match self {
            NodeChange::MasterAdded(host) | NodeChange::MasterRemoved(host) => host,
            NodeChange::WorkerAdded { host, .. } | NodeChange::WorkerRemoved { host, .. } => host,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            NodeChange::MasterRemoved(_) | NodeChange::WorkerRemoved { .. }
        )
    }
}

#[async_trait]
pub trait NodeChangeListener: Send + Sync {
    async fn on_node_change(&self, change: &NodeChange);

    fn listener_name(&self) -> &str;
}

type GroupMap = HashMap<String, BTreeMap<String, HeartBeat>>;

/// Feeds one listener's drain task
struct ListenerQueue {
    name: String,
    sender: mpsc::UnboundedSender<NodeChange>,
}

pub struct ServerNodeManager {
    registry: Arc<dyn Registry>,
    /// Registry key of this node; its own removal is not reported
    self_key: Option<String>,
    host_warmup: Duration,
    masters: RwLock<BTreeMap<String, HeartBeat>>,
    workers: RwLock<GroupMap>,
    listeners: RwLock<Vec<ListenerQueue>>,
}

impl ServerNodeManager {
    pub fn new(registry: Arc<dyn Registry>, self_key: Option<String>, host_warmup: Duration) -> Self {
        Self {
            registry,
            self_key,
            host_warmup,
            masters: RwLock::new(BTreeMap::new()),
            workers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Must be called from within a Tokio runtime; the listener is driven by
    /// a task that lives as long as this manager.
    pub fn add_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        let name = listener.listener_name().to_string();
        let (sender, mut receiver) = mpsc::unbounded_channel::<NodeChange>();
        tokio::spawn(async move {
            while let Some(change) = receiver.recv().await {
                listener.on_node_change(&change).await;
            }
            debug!(listener = listener.listener_name(), "Node change listener stopped");
        });
        info!(listener = %name, "Registered node change listener");
        self.listeners.write().push(ListenerQueue { name, sender });
    }

    /// Subscribe to registry changes, load the current snapshot and keep the
    /// cache in sync until shutdown.
    pub async fn start(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> RegistryResult<JoinHandle<()>> {
        // Subscribe first so nothing between snapshot and watch is missed
        let mut events = self.registry.subscribe();
        self.resync().await?;

        let manager = Arc::clone(&self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => manager.apply(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Registry watch lagged, reloading snapshot");
                            if let Err(e) = manager.resync().await {
                                warn!(error = %e, "Failed to reload registry snapshot");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Node manager watch stopped");
        }))
    }

    /// Replace the cache with a fresh snapshot, reporting the difference
    pub async fn resync(&self) -> RegistryResult<()> {
        let mut masters = BTreeMap::new();
        for (key, value) in self.registry.children(paths::MASTERS).await? {
            if let Some(NodePath::Master(host)) = parse_node_path(&key) {
                match HeartBeat::decode(&key, &value) {
                    Ok(heartbeat) => {
                        masters.insert(host.key(), heartbeat);
                    }
                    Err(e) => warn!(error = %e, "Skipping unreadable master heartbeat"),
                }
            }
        }

        let mut workers: GroupMap = HashMap::new();
        for (key, value) in self.registry.children(paths::WORKERS).await? {
            if let Some(NodePath::Worker { group, host }) = parse_node_path(&key) {
                match HeartBeat::decode(&key, &value) {
                    Ok(heartbeat) => {
                        workers.entry(group).or_default().insert(host.key(), heartbeat);
                    }
                    Err(e) => warn!(error = %e, "Skipping unreadable worker heartbeat"),
                }
            }
        }

        let mut changes = Vec::new();
        {
            let mut current = self.masters.write();
            for key in current.keys().filter(|k| !masters.contains_key(*k)) {
                if let Ok(host) = key.parse() {
                    changes.push(NodeChange::MasterRemoved(host));
                }
            }
            for key in masters.keys().filter(|k| !current.contains_key(*k)) {
                if let Ok(host) = key.parse() {
                    changes.push(NodeChange::MasterAdded(host));
                }
            }
            *current = masters;
        }
        {
            let mut current = self.workers.write();
            for (group, hosts) in current.iter() {
                for key in hosts.keys() {
                    let still_there = workers.get(group).is_some_and(|g| g.contains_key(key));
                    if !still_there {
                        if let Ok(host) = key.parse() {
                            changes.push(NodeChange::WorkerRemoved {
                                group: group.clone(),
                                host,
                            });
                        }
                    }
                }
            }
            for (group, hosts) in workers.iter() {
                for key in hosts.keys() {
                    let known = current.get(group).is_some_and(|g| g.contains_key(key));
                    if !known {
                        if let Ok(host) = key.parse() {
                            changes.push(NodeChange::WorkerAdded {
                                group: group.clone(),
                                host,
                            });
                        }
                    }
                }
            }
            *current = workers;
        }

        for change in changes {
            self.notify(change);
        }
        Ok(())
    }

    /// Apply one watch event to the cache
    pub async fn apply(&self, event: RegistryEvent) {
        let Some(node) = parse_node_path(event.key()) else {
            return;
        };

        let change = match (&event, node) {
            (RegistryEvent::Added { key, value } | RegistryEvent::Updated { key, value }, node) => {
                let heartbeat = match HeartBeat::decode(key, value) {
                    Ok(heartbeat) => heartbeat,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unreadable heartbeat");
                        return;
                    }
                };
                match node {
                    NodePath::Master(host) => self
                        .masters
                        .write()
                        .insert(host.key(), heartbeat)
                        .is_none()
                        .then_some(NodeChange::MasterAdded(host)),
                    NodePath::Worker { group, host } => self
                        .workers
                        .write()
                        .entry(group.clone())
                        .or_default()
                        .insert(host.key(), heartbeat)
                        .is_none()
                        .then_some(NodeChange::WorkerAdded { group, host }),
                }
            }
            (RegistryEvent::Removed { .. }, NodePath::Master(host)) => self
                .masters
                .write()
                .remove(&host.key())
                .map(|_| NodeChange::MasterRemoved(host)),
            (RegistryEvent::Removed { .. }, NodePath::Worker { group, host }) => {
                let mut workers = self.workers.write();
                let removed = workers
                    .get_mut(&group)
                    .and_then(|hosts| hosts.remove(&host.key()));
                if workers.get(&group).is_some_and(|hosts| hosts.is_empty()) {
                    workers.remove(&group);
                }
                removed.map(|_| NodeChange::WorkerRemoved { group, host })
            }
        };

        if let Some(change) = change {
            self.notify(change);
        }
    }

    fn notify(&self, change: NodeChange) {
        if change.is_removal() {
            let own_removal = self.self_key.as_deref().is_some_and(|own| match &change {
                NodeChange::MasterRemoved(host) => own == paths::master_path(host),
                NodeChange::WorkerRemoved { group, host } => own == paths::worker_path(group, host),
                _ => false,
            });
            if own_removal {
                warn!(host = %change.host(), "Own registration disappeared, ignoring");
                return;
            }
            info!(change = ?change, "Node removed from registry");
        } else {
            debug!(change = ?change, "Node added to registry");
        }

        for queue in self.listeners.read().iter() {
            if queue.sender.send(change.clone()).is_err() {
                warn!(listener = %queue.name, "Node change listener is gone, dropping change");
            }
        }
    }

    /// Masters in the cache, ordered by `host:port`
    pub fn master_hosts(&self) -> Vec<Host> {
        self.masters
            .read()
            .keys()
            .filter_map(|key| key.parse().ok())
            .collect()
    }

    /// Non-busy workers of `group`, ordered by `host:port`, with their weight attached
    pub fn worker_hosts(&self, group: &str) -> Vec<Host> {
        let now = Utc::now();
        self.workers
            .read()
            .get(group)
            .map(|hosts| {
                hosts
                    .iter()
                    .filter(|(_, heartbeat)| !heartbeat.is_busy())
                    .filter_map(|(key, heartbeat)| {
                        key.parse::<Host>().ok().map(|host| {
                            let weight = HostWeight::from_heartbeat(heartbeat, self.host_warmup, now);
                            host.with_weight(weight.value())
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn worker_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.workers.read().keys().cloned().collect();
        groups.sort();
        groups
    }

    pub fn worker_heartbeat(&self, group: &str, host: &Host) -> Option<HeartBeat> {
        self.workers
            .read()
            .get(group)
            .and_then(|hosts| hosts.get(&host.key()).cloned())
    }

    /// Whether `host` is registered as a worker in any group
    pub fn is_worker_alive(&self, host: &Host) -> bool {
        let key = host.key();
        self.workers
            .read()
            .values()
            .any(|hosts| hosts.contains_key(&key))
    }

    pub fn is_master_alive(&self, host: &Host) -> bool {
        self.masters.read().contains_key(&host.key())
    }
}
