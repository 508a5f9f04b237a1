//! Configuration Loader
//!
//! Layers built-in defaults, an optional TOML file and `DAGFLOW__` environment
//! overrides through the `config` crate, then validates the result.

use super::error::{ConfigResult, ConfigurationError};
use super::DagflowConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ENV_PREFIX: &str = "DAGFLOW";
const ENV_SEPARATOR: &str = "__";

/// Builder for a validated [`DagflowConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_environment: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file on top of the defaults. The file must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Ignore `DAGFLOW__*` variables (tests)
    pub fn without_environment(mut self) -> Self {
        self.skip_environment = true;
        self
    }

    /// Current deployment environment from `DAGFLOW_ENV`, defaulting to development
    pub fn detect_environment() -> String {
        env::var("DAGFLOW_ENV").unwrap_or_else(|_| "development".to_string())
    }

    pub fn load(&self) -> ConfigResult<DagflowConfig> {
        let defaults = Config::try_from(&DagflowConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigurationError::ConfigFileNotFound {
                    path: path.display().to_string(),
                });
            }
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }

        if !self.skip_environment {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let config: DagflowConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            environment = %Self::detect_environment(),
            master_port = config.master.listen_port,
            worker_port = config.worker.listen_port,
            worker_group = %config.worker.group,
            host_selector = %config.master.host_selector,
            "Configuration loaded successfully"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = ConfigLoader::new().without_environment().load().unwrap();
        assert_eq!(config, DagflowConfig::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[master]
listen_port = 7000
host_selector = "round_robin"

[dispatch]
request_timeout_ms = 250

[worker]
group = "etl"
"#
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_file(file.path())
            .without_environment()
            .load()
            .unwrap();

        assert_eq!(config.master.listen_port, 7000);
        assert_eq!(
            config.master.host_selector,
            crate::dispatch::selector::SelectorKind::RoundRobin
        );
        assert_eq!(config.dispatch.request_timeout_ms, 250);
        assert_eq!(config.worker.group, "etl");
        // Untouched keys keep their defaults
        assert_eq!(config.worker.exec_threads, 100);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ConfigLoader::new()
            .with_file("/definitely/not/here.toml")
            .without_environment()
            .load();
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_file_value_fails_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[worker]\nexec_threads = 0").unwrap();

        let result = ConfigLoader::new()
            .with_file(file.path())
            .without_environment()
            .load();
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }
}
