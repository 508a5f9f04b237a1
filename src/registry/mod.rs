//! # Registry & Liveness
//!
//! Nodes publish heartbeats under ephemeral keys; peers watch those keys to
//! learn who is alive. A vanished key is how a dead node is detected.

pub mod client;
pub mod errors;
pub mod heartbeat;
pub mod node_manager;
pub mod paths;
pub mod store;

pub use client::RegistryClient;
pub use errors::{RegistryError, RegistryResult};
pub use heartbeat::{
    FixedResourceProbe, HeartBeat, HeartBeatProducer, NodeRole, ResourceProbe,
    ResourceThresholds, ResourceUsage, ServerStatus, SystemResourceProbe,
};
pub use node_manager::{NodeChange, NodeChangeListener, ServerNodeManager};
pub use store::{InMemoryRegistry, LeaseId, Registry, RegistryEvent};
