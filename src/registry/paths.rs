//! Registry key namespace
//!
//! ```text
//! /masters/<host:port>
//! /workers/<group>/<host:port>
//! /lock/failover/<host:port>
//! ```

use crate::dispatch::host::Host;

pub const MASTERS: &str = "/masters";
pub const WORKERS: &str = "/workers";
pub const LOCKS: &str = "/lock";
pub const FAILOVER_LOCKS: &str = "/lock/failover";

/// Namespaces that must exist before any node registers
pub const REQUIRED_NAMESPACES: [&str; 3] = [MASTERS, WORKERS, LOCKS];

pub fn master_path(host: &Host) -> String {
    format!("{MASTERS}/{}", host.key())
}

pub fn worker_group_path(group: &str) -> String {
    format!("{WORKERS}/{group}")
}

pub fn worker_path(group: &str, host: &Host) -> String {
    format!("{WORKERS}/{group}/{}", host.key())
}

pub fn failover_lock_path(host: &Host) -> String {
    format!("{FAILOVER_LOCKS}/{}", host.key())
}

/// A registered node decoded from its key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePath {
    Master(Host),
    Worker { group: String, host: Host },
}

impl NodePath {
    pub fn host(&self) -> &Host {
        match self {
            NodePath::Master(host) => host,
            NodePath::Worker { host, .. } => host,
        }
    }
}

/// Decode a node key; namespace keys and lock keys yield `None`
pub fn parse_node_path(key: &str) -> Option<NodePath> {
    if let Some(rest) = key.strip_prefix(MASTERS).and_then(|r| r.strip_prefix('/')) {
        return rest.parse().ok().map(NodePath::Master);
    }
    let rest = key.strip_prefix(WORKERS)?.strip_prefix('/')?;
    let (group, host) = rest.split_once('/')?;
    if group.is_empty() {
        return None;
    }
    let host = host.parse().ok()?;
    Some(NodePath::Worker {
        group: group.to_string(),
        host,
    })
}
