//! Network identity of a master or worker node, and its selection weight

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use crate::registry::heartbeat::HeartBeat;

const CPU_FACTOR: f64 = 10.0;
const MEMORY_FACTOR: f64 = 20.0;
const LOAD_AVERAGE_FACTOR: f64 = 70.0;
/// Extra weight of a freshly started worker, decaying to zero over the warm-up window
const WARMUP_PENALTY: f64 = 100.0;

/// A node address as published in the registry.
///
/// Equality and hashing only consider `address` and `port`; `weight` is a
/// load snapshot attached by the node cache for host selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl Host {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// `address:port`, the key used in the registry and the connection cache
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// A host can be dialled only with a non-empty address and a non-zero port
    pub fn is_usable(&self) -> bool {
        !self.address.trim().is_empty() && self.port != 0
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Host {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid host, expected address:port: {s}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in host {s}: {e}"))?;
        Ok(Host::new(address, port))
    }
}

/// Load metric used by the lowest-weight selector; smaller is preferred.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostWeight(f64);

impl HostWeight {
    pub fn value(self) -> f64 {
        self.0
    }

    /// `cpu*10 + memory*20 + load*70`, scaled down by the configured host weight
    /// (100 is neutral) and raised while the worker is still warming up.
    pub fn from_heartbeat(heartbeat: &HeartBeat, warmup: Duration, now: DateTime<Utc>) -> Self {
        let load = heartbeat.cpu_usage * CPU_FACTOR
            + heartbeat.memory_usage * MEMORY_FACTOR
            + heartbeat.load_average * LOAD_AVERAGE_FACTOR;
        let capacity = f64::from(heartbeat.host_weight().max(1)) / 100.0;

        let uptime = (now - heartbeat.start_time).to_std().unwrap_or(Duration::ZERO);
        let penalty = if warmup.is_zero() || uptime >= warmup {
            0.0
        } else {
            WARMUP_PENALTY * (1.0 - uptime.as_secs_f64() / warmup.as_secs_f64())
        };

        Self(load / capacity + penalty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let host: Host = "10.0.0.1:5678".parse().unwrap();
        assert_eq!(host.address, "10.0.0.1");
        assert_eq!(host.port, 5678);
        assert_eq!(host.to_string(), "10.0.0.1:5678");
        assert!("no-port".parse::<Host>().is_err());
    }

    #[test]
    fn test_weight_does_not_affect_identity() {
        let plain = Host::new("a", 1);
        let weighted = Host::new("a", 1).with_weight(3.5);
        assert_eq!(plain, weighted);
    }

    fn heartbeat(load_average: f64, host_weight: u32, started_secs_ago: i64) -> HeartBeat {
        use crate::registry::heartbeat::{NodeRole, ServerStatus};
        let now = Utc::now();
        HeartBeat {
            host: "w:1".to_string(),
            process_id: 1,
            start_time: now - chrono::Duration::seconds(started_secs_ago),
            report_time: now,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            load_average,
            available_physical_memory_size: 4.0,
            server_status: ServerStatus::Normal,
            role: NodeRole::Worker {
                worker_group: "default".to_string(),
                host_weight,
                worker_exec_threads: 4,
                running_task_count: 0,
            },
        }
    }

    #[test]
    fn test_weight_scales_with_load_and_capacity() {
        let warmup = Duration::from_secs(60);
        let now = Utc::now();
        let light = HostWeight::from_heartbeat(&heartbeat(1.0, 100, 3600), warmup, now);
        let heavy = HostWeight::from_heartbeat(&heartbeat(2.0, 100, 3600), warmup, now);
        let big_box = HostWeight::from_heartbeat(&heartbeat(2.0, 200, 3600), warmup, now);

        assert!((light.value() - 70.0).abs() < 1e-6);
        assert!(heavy.value() > light.value());
        assert!((big_box.value() - light.value()).abs() < 1e-6);
    }

    #[test]
    fn test_warming_host_is_penalised() {
        let warmup = Duration::from_secs(600);
        let now = Utc::now();
        let fresh = HostWeight::from_heartbeat(&heartbeat(1.0, 100, 0), warmup, now);
        let warm = HostWeight::from_heartbeat(&heartbeat(1.0, 100, 3600), warmup, now);
        assert!(fresh.value() > warm.value());
    }

    #[test]
    fn test_usability() {
        assert!(Host::new("a", 1).is_usable());
        assert!(!Host::new("", 1).is_usable());
        assert!(!Host::new("a", 0).is_usable());
    }
}
