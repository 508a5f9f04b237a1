//! # Node Configuration
//!
//! Typed configuration for master and worker nodes. Values are layered by
//! [`ConfigLoader`]: built-in defaults, then an optional TOML file, then
//! `DAGFLOW__<SECTION>__<KEY>` environment variables.
//!
//! ```rust,no_run
//! use dagflow_core::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().with_file("config/dagflow.toml").load()?;
//! let timeout = config.dispatch.request_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::selector::SelectorKind;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration shared by both node roles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DagflowConfig {
    pub remoting: RemotingConfig,
    pub registry: RegistryConfig,
    pub master: MasterConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl DagflowConfig {
    /// Reject combinations that would make the node misbehave at runtime
    pub fn validate(&self) -> ConfigResult<()> {
        positive("remoting.handler_threads", self.remoting.handler_threads as u64)?;
        positive("remoting.connect_timeout_ms", self.remoting.connect_timeout_ms)?;
        positive("remoting.max_frame_length", self.remoting.max_frame_length as u64)?;
        positive("dispatch.request_timeout_ms", self.dispatch.request_timeout_ms)?;
        positive("master.heartbeat_interval_ms", self.master.heartbeat_interval_ms)?;
        positive("worker.heartbeat_interval_ms", self.worker.heartbeat_interval_ms)?;
        positive("worker.exec_threads", self.worker.exec_threads as u64)?;
        positive("worker.host_weight", self.worker.host_weight as u64)?;

        if self.worker.group.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "worker.group",
                &self.worker.group,
                "worker group cannot be empty",
            ));
        }

        let slowest_heartbeat = self
            .master
            .heartbeat_interval_ms
            .max(self.worker.heartbeat_interval_ms);
        if self.registry.session_timeout_ms <= slowest_heartbeat {
            return Err(ConfigurationError::invalid_value(
                "registry.session_timeout_ms",
                self.registry.session_timeout_ms,
                format!(
                    "must exceed the heartbeat interval ({slowest_heartbeat}ms) or registrations expire between refreshes"
                ),
            ));
        }

        Ok(())
    }
}

fn positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigurationError::invalid_value(
            field,
            value,
            "must be greater than zero",
        ));
    }
    Ok(())
}

/// RPC transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    pub connect_timeout_ms: u64,
    /// Maximum number of command handlers running at once
    pub handler_threads: usize,
    pub max_frame_length: usize,
    pub future_reaper_interval_ms: u64,
    /// Outbound commands buffered per connection
    pub write_queue_size: usize,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            handler_threads: 16,
            max_frame_length: crate::remote::codec::DEFAULT_MAX_FRAME_LENGTH,
            future_reaper_interval_ms: 1_000,
            write_queue_size: 1_024,
        }
    }
}

impl RemotingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn future_reaper_interval(&self) -> Duration {
        Duration::from_millis(self.future_reaper_interval_ms)
    }
}

/// Registry session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A registration not refreshed within this window is considered dead
    pub session_timeout_ms: u64,
    pub lease_reaper_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            lease_reaper_interval_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn lease_reaper_interval(&self) -> Duration {
        Duration::from_millis(self.lease_reaper_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// Bind address of the read-only dispatch HTTP views
    pub web_bind_address: String,
    pub heartbeat_interval_ms: u64,
    pub host_selector: SelectorKind,
    /// Workers younger than this get a decaying weight penalty
    pub host_warmup_ms: u64,
    pub max_cpu_load_avg: f64,
    pub reserved_memory_gb: f64,
    /// Delay before a surviving master claims a dead master's workflows
    pub failover_interval_ms: u64,
    /// Capacity of each workflow runnable's event queue
    pub event_queue_size: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 5678,
            web_bind_address: "127.0.0.1:5679".to_string(),
            heartbeat_interval_ms: 10_000,
            host_selector: SelectorKind::LowerWeight,
            host_warmup_ms: 10 * 60 * 1_000,
            max_cpu_load_avg: f64::from(u32::try_from(num_cpus()).unwrap_or(1)) * 2.0,
            reserved_memory_gb: 0.3,
            failover_interval_ms: 1_000,
            event_queue_size: 1_024,
        }
    }
}

impl MasterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn failover_interval(&self) -> Duration {
        Duration::from_millis(self.failover_interval_ms)
    }

    pub fn host_warmup(&self) -> Duration {
        Duration::from_millis(self.host_warmup_ms)
    }
}

/// Dispatch and re-dispatch policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Budget for one synchronous dispatch request
    pub request_timeout_ms: u64,
    /// Dispatch attempts beyond the first before the task fails
    pub max_task_commit_retries: u32,
    /// Fixed delay between dispatch attempts
    pub task_commit_interval_ms: u64,
    /// Re-dispatches allowed after the task's worker dies
    pub max_failover_times: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_task_commit_retries: 5,
            task_commit_interval_ms: 1_000,
            max_failover_times: 3,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn task_commit_interval(&self) -> Duration {
        Duration::from_millis(self.task_commit_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub heartbeat_interval_ms: u64,
    pub group: String,
    /// Relative capacity, 100 is the baseline
    pub host_weight: u32,
    /// Maximum task instances running at once
    pub exec_threads: usize,
    pub max_cpu_load_avg: f64,
    pub reserved_memory_gb: f64,
    /// Resend interval for unacknowledged running/result reports
    pub ack_retry_interval_ms: u64,
    /// Budget for one report to the master
    pub report_timeout_ms: u64,
    /// Resends before a report is given up; zero means no limit
    pub report_max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 1234,
            heartbeat_interval_ms: 10_000,
            group: "default".to_string(),
            host_weight: 100,
            exec_threads: 100,
            max_cpu_load_avg: f64::from(u32::try_from(num_cpus()).unwrap_or(1)) * 2.0,
            reserved_memory_gb: 0.3,
            ack_retry_interval_ms: 5_000,
            report_timeout_ms: 3_000,
            report_max_retries: 720,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ack_retry_interval(&self) -> Duration {
        Duration::from_millis(self.ack_retry_interval_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: Option<String>,
    pub json: bool,
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        DagflowConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_request_timeout_is_rejected() {
        let mut config = DagflowConfig::default();
        config.dispatch.request_timeout_ms = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch.request_timeout_ms"));
    }

    #[test]
    fn test_session_timeout_must_exceed_heartbeat() {
        let mut config = DagflowConfig::default();
        config.registry.session_timeout_ms = config.worker.heartbeat_interval_ms;

        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_worker_group_is_rejected() {
        let mut config = DagflowConfig::default();
        config.worker.group = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
