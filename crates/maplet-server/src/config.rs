//! Daemon configuration.
//!
//! Two sections matter to this binary: `server` (the gRPC surface and the
//! supervisor thresholds) and `worker` (the pool, see
//! `maplet_pool::WorkerOptions`). Every key can be overridden by an
//! environment variable named after its path, upper-cased and joined with
//! `__` under the `CONF_` prefix: `CONF_SERVER__TIMEOUT=30`,
//! `CONF_WORKER__NUM_PROCESSES=4`. List values parse from
//! comma-separated strings.

use std::ffi::OsStr;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{
    Config, ConfigError, Environment, FileFormat,
    builder::{ConfigBuilder, DefaultState},
};
use serde::{Deserialize, Serialize};

/// The `server` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the gRPC server listens on.
    listen: SocketAddr,
    /// Expose the admin plane.
    enable_admin_services: bool,
    /// Per-request timeout, seconds, measured from submission.
    timeout: u64,
    /// Time granted to in-flight requests to drain at shutdown, seconds.
    shutdown_grace_period: u64,
    /// Failure pressure above which the daemon aborts (exit code 3).
    max_failure_pressure: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 23456),
            enable_admin_services: true,
            timeout: 20,
            shutdown_grace_period: 10,
            max_failure_pressure: 0.9,
        }
    }
}

impl ServerConfig {
    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub fn enable_admin_services(&self) -> bool {
        self.enable_admin_services
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }

    pub fn max_failure_pressure(&self) -> f64 {
        self.max_failure_pressure
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_failure_pressure) {
            return Err(ConfigError::Message(
                "'max_failure_pressure' must be between 0 and 1".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Message(
                "'timeout' must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// The `logging` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Daemon settings.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: Logging,
    pub server: ServerConfig,
    pub worker: maplet_pool::WorkerOptions,
}

impl Settings {
    fn validate(self) -> Result<Self, ConfigError> {
        self.server.validate()?;
        self.worker
            .validate()
            .map_err(|err| ConfigError::Message(err.to_string()))?;
        Ok(self)
    }

    fn builder() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(
            Environment::with_prefix("conf")
                .prefix_separator("_")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("worker.restore_projects"),
        )
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| settings.validate())
    }

    fn error<T: Display>(msg: T) -> ConfigError {
        ConfigError::Message(format!("{msg}"))
    }

    /// Defaults plus environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::build(Self::builder())
    }

    /// Json configuration from an environment variable, then env overrides.
    pub fn from_env<K: AsRef<OsStr>>(key: K) -> Result<Self, ConfigError> {
        match std::env::var(key) {
            Ok(content) => Self::build(
                Self::builder().add_source(config::File::from_str(&content, FileFormat::Json)),
            ),
            Err(std::env::VarError::NotPresent) => Self::new(),
            Err(err) => Err(Self::error(err)),
        }
    }

    /// Toml configuration file, then env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::build(Self::builder().add_source(config::File::from(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default().validate().unwrap();
        assert_eq!(settings.server.listen().port(), 23456);
        assert!(settings.server.enable_admin_services());
        assert_eq!(settings.server.timeout(), Duration::from_secs(20));
    }

    #[test]
    fn toml_sections_deserialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maplet.toml");
        std::fs::write(
            &path,
            r#"
[server]
listen = "0.0.0.0:4000"
timeout = 5

[worker]
name = "pool-a"
num_processes = 3
restore_projects = ["/france/parcels"]

[worker.engine]
max_projects = 16

[worker.engine.search_paths]
"/france" = "file:///srv/france"
"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.server.listen().port(), 4000);
        assert_eq!(settings.worker.num_processes(), 3);
        assert_eq!(settings.worker.restore_projects, ["/france/parcels"]);
        assert_eq!(settings.worker.engine["max_projects"], 16);
    }

    #[test]
    fn out_of_range_pressure_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maplet.toml");
        std::fs::write(&path, "[server]\nmax_failure_pressure = 1.5\n").unwrap();
        assert!(Settings::from_file(&path).is_err());
    }
}
