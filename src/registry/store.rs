//! Coordination service contract and the in-process implementation
//!
//! Keys bound to a lease are ephemeral: when the lease is revoked or not kept
//! alive within its TTL, every key it owns disappears and watchers receive a
//! [`RegistryEvent::Removed`]. That removal is the liveness signal for nodes.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::errors::{RegistryError, RegistryResult};

pub type LeaseId = i64;

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Change notification for a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added { key: String, value: String },
    Updated { key: String, value: String },
    Removed { key: String },
}

impl RegistryEvent {
    pub fn key(&self) -> &str {
        match self {
            RegistryEvent::Added { key, .. }
            | RegistryEvent::Updated { key, .. }
            | RegistryEvent::Removed { key } => key,
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Create a lease that expires unless kept alive within `ttl`
    async fn grant_lease(&self, ttl: Duration) -> RegistryResult<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Drop a lease and every key bound to it
    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Write a key, ephemeral when `lease` is given
    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> RegistryResult<()>;

    async fn get(&self, key: &str) -> RegistryResult<Option<String>>;

    async fn delete(&self, key: &str) -> RegistryResult<bool>;

    /// All keys strictly below `prefix`, sorted by key
    async fn children(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>>;

    async fn exists(&self, key: &str) -> RegistryResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;

    /// Take `key` as a lock owned by `lease`; re-entrant for the same lease
    async fn try_lock(&self, key: &str, lease: LeaseId) -> RegistryResult<bool>;

    async fn unlock(&self, key: &str, lease: LeaseId) -> RegistryResult<()>;
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

/// In-process registry with lease-bound ephemeral keys.
///
/// Backs tests and single-process deployments; the lease reaper must be
/// running for TTL expiry to happen on its own.
#[derive(Debug)]
pub struct InMemoryRegistry {
    entries: DashMap<String, StoredValue>,
    leases: DashMap<LeaseId, Lease>,
    next_lease: AtomicI64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            leases: DashMap::new(),
            next_lease: AtomicI64::new(1),
            events,
        }
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire a lease immediately, as if its owner had stopped heartbeating
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        match self.leases.remove(&lease) {
            Some((_, state)) => {
                self.drop_lease_keys(lease, state.keys);
                true
            }
            None => false,
        }
    }

    /// Expire every lease past its deadline; returns how many expired
    pub fn reap_expired_leases(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for lease in expired {
            if let Some((_, state)) = self.leases.remove_if(&lease, |_, l| l.deadline <= now) {
                info!(lease = lease, keys = state.keys.len(), "Lease expired");
                self.drop_lease_keys(lease, state.keys);
                count += 1;
            }
        }
        count
    }

    pub fn spawn_lease_reaper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap_expired_leases();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Lease reaper stopped");
        })
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    fn drop_lease_keys(&self, lease: LeaseId, keys: HashSet<String>) {
        for key in keys {
            let removed = self
                .entries
                .remove_if(&key, |_, stored| stored.lease == Some(lease));
            if removed.is_some() {
                let _ = self.events.send(RegistryEvent::Removed { key });
            }
        }
    }

    fn attach(&self, key: &str, lease: LeaseId) -> RegistryResult<()> {
        let mut state = self
            .leases
            .get_mut(&lease)
            .ok_or(RegistryError::LeaseNotFound(lease))?;
        state.keys.insert(key.to_string());
        Ok(())
    }

    fn detach(&self, key: &str, lease: Option<LeaseId>) {
        if let Some(lease) = lease {
            if let Some(mut state) = self.leases.get_mut(&lease) {
                state.keys.remove(key);
            }
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn grant_lease(&self, ttl: Duration) -> RegistryResult<LeaseId> {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut state = self
            .leases
            .get_mut(&lease)
            .ok_or(RegistryError::LeaseNotFound(lease))?;
        state.deadline = Instant::now() + state.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()> {
        if self.expire_lease(lease) {
            Ok(())
        } else {
            Err(RegistryError::LeaseNotFound(lease))
        }
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> RegistryResult<()> {
        if let Some(lease) = lease {
            self.attach(key, lease)?;
        }

        let previous = self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                lease,
            },
        );

        let event = match previous {
            Some(previous) => {
                if previous.lease != lease {
                    self.detach(key, previous.lease);
                }
                RegistryEvent::Updated {
                    key: key.to_string(),
                    value,
                }
            }
            None => RegistryEvent::Added {
                key: key.to_string(),
                value,
            },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn get(&self, key: &str) -> RegistryResult<Option<String>> {
        Ok(self.entries.get(key).map(|stored| stored.value.clone()))
    }

    async fn delete(&self, key: &str) -> RegistryResult<bool> {
        match self.entries.remove(key) {
            Some((_, stored)) => {
                self.detach(key, stored.lease);
                let _ = self.events.send(RegistryEvent::Removed {
                    key: key.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn children(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut children: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn try_lock(&self, key: &str, lease: LeaseId) -> RegistryResult<bool> {
        if !self.leases.contains_key(&lease) {
            return Err(RegistryError::LeaseNotFound(lease));
        }
        let acquired = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.get().lease == Some(lease),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: lease.to_string(),
                    lease: Some(lease),
                });
                true
            }
        };
        if acquired {
            self.attach(key, lease)?;
        }
        Ok(acquired)
    }

    async fn unlock(&self, key: &str, lease: LeaseId) -> RegistryResult<()> {
        if self
            .entries
            .remove_if(key, |_, stored| stored.lease == Some(lease))
            .is_some()
        {
            self.detach(key, Some(lease));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_children_are_sorted_and_scoped() {
        let registry = InMemoryRegistry::new();
        registry.put("/workers", String::new(), None).await.unwrap();
        registry.put("/workers/b/h:2", "2".into(), None).await.unwrap();
        registry.put("/workers/a/h:1", "1".into(), None).await.unwrap();
        registry.put("/workersX/a", "x".into(), None).await.unwrap();

        let children = registry.children("/workers").await.unwrap();
        let keys: Vec<&str> = children.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/workers/a/h:1", "/workers/b/h:2"]);
    }

    #[tokio::test]
    async fn test_expired_lease_removes_ephemeral_keys() {
        let registry = InMemoryRegistry::new();
        let mut events = registry.subscribe();

        let lease = registry.grant_lease(Duration::from_millis(20)).await.unwrap();
        registry
            .put("/masters/m:1", "hb".into(), Some(lease))
            .await
            .unwrap();
        registry.put("/persistent", "p".into(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.reap_expired_leases(), 1);

        assert_eq!(registry.get("/masters/m:1").await.unwrap(), None);
        assert!(registry.exists("/persistent").await.unwrap());

        let mut removed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::Removed { key } = event {
                removed.push(key);
            }
        }
        assert_eq!(removed, vec!["/masters/m:1".to_string()]);
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let registry = InMemoryRegistry::new();
        let lease = registry.grant_lease(Duration::from_millis(50)).await.unwrap();
        registry.put("/k", "v".into(), Some(lease)).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.keep_alive(lease).await.unwrap();
            assert_eq!(registry.reap_expired_leases(), 0);
        }
        assert!(registry.exists("/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released_with_lease() {
        let registry = InMemoryRegistry::new();
        let a = registry.grant_lease(Duration::from_secs(60)).await.unwrap();
        let b = registry.grant_lease(Duration::from_secs(60)).await.unwrap();

        assert!(registry.try_lock("/lock/failover/x:1", a).await.unwrap());
        assert!(registry.try_lock("/lock/failover/x:1", a).await.unwrap());
        assert!(!registry.try_lock("/lock/failover/x:1", b).await.unwrap());

        registry.revoke_lease(a).await.unwrap();
        assert!(registry.try_lock("/lock/failover/x:1", b).await.unwrap());

        registry.unlock("/lock/failover/x:1", b).await.unwrap();
        assert!(!registry.exists("/lock/failover/x:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let registry = InMemoryRegistry::new();
        let result = registry.put("/k", "v".into(), Some(42)).await;
        assert!(matches!(result, Err(RegistryError::LeaseNotFound(42))));
    }
}
