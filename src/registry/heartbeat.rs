//! Node heartbeats and resource sampling

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;

use super::errors::{RegistryError, RegistryResult};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Normal,
    /// Over a resource threshold; takes no new dispatches
    Busy,
}

/// Role-specific part of a heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker {
        worker_group: String,
        host_weight: u32,
        worker_exec_threads: usize,
        running_task_count: usize,
    },
}

/// Content of a node's ephemeral registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    pub host: String,
    pub process_id: u32,
    pub start_time: DateTime<Utc>,
    pub report_time: DateTime<Utc>,
    /// Fraction of total CPU, 0.0..=1.0
    pub cpu_usage: f64,
    /// Fraction of physical memory in use, 0.0..=1.0
    pub memory_usage: f64,
    pub load_average: f64,
    /// Available physical memory in GB
    pub available_physical_memory_size: f64,
    pub server_status: ServerStatus,
    pub role: NodeRole,
}

impl HeartBeat {
    pub fn encode(&self) -> RegistryResult<String> {
        serde_json::to_string(self).map_err(|e| RegistryError::InvalidHeartBeat {
            key: self.host.clone(),
            reason: e.to_string(),
        })
    }

    pub fn decode(key: &str, value: &str) -> RegistryResult<Self> {
        serde_json::from_str(value).map_err(|e| RegistryError::InvalidHeartBeat {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.server_status == ServerStatus::Busy
    }

    pub fn host_weight(&self) -> u32 {
        match &self.role {
            NodeRole::Worker { host_weight, .. } => *host_weight,
            NodeRole::Master => 100,
        }
    }
}

/// One resource sample
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub load_average: f64,
    pub available_memory_gb: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples the local machine with sysinfo
pub struct SystemResourceProbe {
    system: Mutex<System>,
}

impl SystemResourceProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemResourceProbe {
    fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory() as f64;
        let available = system.available_memory() as f64;
        let memory_usage = if total > 0.0 {
            ((total - available) / total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        ResourceUsage {
            cpu_usage: f64::from(system.global_cpu_info().cpu_usage()) / 100.0,
            memory_usage,
            load_average: System::load_average().one,
            available_memory_gb: available / BYTES_PER_GB,
        }
    }
}

/// Returns a fixed sample; lets tests pin a node's load
#[derive(Debug, Clone, Default)]
pub struct FixedResourceProbe(pub ResourceUsage);

impl ResourceProbe for FixedResourceProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

/// Thresholds beyond which a node reports itself busy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub max_cpu_load_avg: f64,
    pub reserved_memory_gb: f64,
}

impl ResourceThresholds {
    pub fn is_overloaded(&self, usage: &ResourceUsage) -> bool {
        usage.load_average > self.max_cpu_load_avg
            || usage.available_memory_gb < self.reserved_memory_gb
    }
}

/// Source of the role section, read at every heartbeat
pub type RoleSource = Arc<dyn Fn() -> NodeRole + Send + Sync>;

/// Builds the heartbeat a node publishes on each refresh
#[derive(Clone)]
pub struct HeartBeatProducer {
    host: String,
    start_time: DateTime<Utc>,
    probe: Arc<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    role: RoleSource,
}

impl HeartBeatProducer {
    pub fn new(
        host: impl Into<String>,
        probe: Arc<dyn ResourceProbe>,
        thresholds: ResourceThresholds,
        role: RoleSource,
    ) -> Self {
        Self {
            host: host.into(),
            start_time: Utc::now(),
            probe,
            thresholds,
            role,
        }
    }

    pub fn produce(&self) -> HeartBeat {
        let usage = self.probe.sample();
        let role = (self.role)();

        let exec_slots_full = matches!(
            role,
            NodeRole::Worker { worker_exec_threads, running_task_count, .. }
                if running_task_count >= worker_exec_threads
        );
        let server_status = if exec_slots_full || self.thresholds.is_overloaded(&usage) {
            ServerStatus::Busy
        } else {
            ServerStatus::Normal
        };

        HeartBeat {
            host: self.host.clone(),
            process_id: std::process::id(),
            start_time: self.start_time,
            report_time: Utc::now(),
            cpu_usage: usage.cpu_usage,
            memory_usage: usage.memory_usage,
            load_average: usage.load_average,
            available_physical_memory_size: usage.available_memory_gb,
            server_status,
            role,
        }
    }
}
