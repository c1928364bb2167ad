//! Configuration management for the orchestrator
//!
//! Settings are loaded from environment variables with defaults; CLI flags
//! override the deployment, catalog and state directory afterwards.
//!
//! # Environment Variables
//!
//! - `ROLLOUT_DEPLOYMENT`: Deployment name - default: "default"
//! - `ROLLOUT_CATALOG`: Service catalog YAML - default: "rollout.yaml"
//! - `ROLLOUT_STATE_DIR`: Phase records, locks and backups - default: ".rollout"
//! - `ROLLOUT_LAUNCHER`: Launcher backend (docker|process) - default: "docker"
//! - `ROLLOUT_DOCKER_NETWORK`: Network for started containers - default: unset
//! - `ROLLOUT_HEALTH_MAX_ATTEMPTS`: Health polls before timing out - default: "30"
//! - `ROLLOUT_HEALTH_INTERVAL_MS`: Delay between health polls - default: "2000"
//! - `ROLLOUT_PROBE_TIMEOUT_SECS`: Timeout of a single health poll - default: "5"
//! - `ROLLOUT_STOP_TIMEOUT_SECS`: Grace period before force-kill - default: "10"
//! - `ROLLOUT_ROUTING_FILE`: Routing table consumed by the gateway - default: `<state_dir>/routing.json`
//! - `ROLLOUT_ROUTING_FORMAT`: Routing file format (json|env) - default: "json"
//! - `ROLLOUT_ROUTING_RELOAD`: Shell command run after each routing write - default: unset
//! - `ROLLOUT_BACKUP_DIR`: Backup storage root - default: `<state_dir>/backups`
//! - `ROLLOUT_LOG_LEVEL`: Logging level - default: "info"
//!
//! # Example
//!
//! ```no_run
//! use rollout::OrchestratorConfig;
//! use std::env;
//!
//! env::set_var("ROLLOUT_LAUNCHER", "process");
//!
//! let config = OrchestratorConfig::default();
//! config.validate().expect("Invalid configuration");
//! println!("{}", config);
//! ```

use crate::launcher::{DockerLauncher, LaunchError, Launcher, ProcessLauncher};
use crate::routing::{FileRoutingStore, RoutingFormat, RoutingStore};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DEPLOYMENT: &str = "default";
const DEFAULT_CATALOG: &str = "rollout.yaml";
const DEFAULT_STATE_DIR: &str = ".rollout";
const DEFAULT_LAUNCHER: &str = "docker";
const DEFAULT_HEALTH_MAX_ATTEMPTS: u32 = 30;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 2000;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ROUTING_FORMAT: &str = "json";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid launcher: {0}. Valid options: docker, process")]
    InvalidLauncher(String),

    #[error("Invalid routing format: {0}. Valid options: json, env")]
    InvalidRoutingFormat(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub deployment: String,
    pub catalog_path: PathBuf,
    pub state_dir: PathBuf,
    /// `docker` or `process`
    pub launcher: String,
    pub docker_network: Option<String>,
    pub health_max_attempts: u32,
    pub health_interval_ms: u64,
    pub probe_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Explicit routing file; `None` means `<state_dir>/routing.json`
    pub routing_file: Option<PathBuf>,
    pub routing_format: String,
    pub routing_reload: Option<String>,
    /// Explicit backup root; `None` means `<state_dir>/backups`
    pub backup_dir: Option<PathBuf>,
    pub log_level: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for OrchestratorConfig {
    /// Loads `ROLLOUT_*` environment variables, falling back to defaults
    fn default() -> Self {
        Self {
            deployment: env_non_empty("ROLLOUT_DEPLOYMENT")
                .unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string()),
            catalog_path: env_non_empty("ROLLOUT_CATALOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG)),
            state_dir: env_non_empty("ROLLOUT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            launcher: env_non_empty("ROLLOUT_LAUNCHER")
                .unwrap_or_else(|| DEFAULT_LAUNCHER.to_string())
                .to_lowercase(),
            docker_network: env_non_empty("ROLLOUT_DOCKER_NETWORK"),
            health_max_attempts: env_parse("ROLLOUT_HEALTH_MAX_ATTEMPTS", DEFAULT_HEALTH_MAX_ATTEMPTS),
            health_interval_ms: env_parse("ROLLOUT_HEALTH_INTERVAL_MS", DEFAULT_HEALTH_INTERVAL_MS),
            probe_timeout_secs: env_parse("ROLLOUT_PROBE_TIMEOUT_SECS", DEFAULT_PROBE_TIMEOUT_SECS),
            stop_timeout_secs: env_parse("ROLLOUT_STOP_TIMEOUT_SECS", DEFAULT_STOP_TIMEOUT_SECS),
            routing_file: env_non_empty("ROLLOUT_ROUTING_FILE").map(PathBuf::from),
            routing_format: env_non_empty("ROLLOUT_ROUTING_FORMAT")
                .unwrap_or_else(|| DEFAULT_ROUTING_FORMAT.to_string())
                .to_lowercase(),
            routing_reload: env_non_empty("ROLLOUT_ROUTING_RELOAD"),
            backup_dir: env_non_empty("ROLLOUT_BACKUP_DIR").map(PathBuf::from),
            log_level: env::var("ROLLOUT_LOG_LEVEL")
                .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
                .to_lowercase(),
        }
    }
}

impl OrchestratorConfig {
    /// Applies CLI overrides on top of the environment
    pub fn with_overrides(
        mut self,
        deployment: Option<String>,
        catalog: Option<PathBuf>,
        state_dir: Option<PathBuf>,
    ) -> Self {
        if let Some(deployment) = deployment {
            self.deployment = deployment;
        }
        if let Some(catalog) = catalog {
            self.catalog_path = catalog;
        }
        if let Some(state_dir) = state_dir {
            self.state_dir = state_dir;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deployment.is_empty()
            || !self
                .deployment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::ValidationFailed(format!(
                "Deployment name '{}' must be non-empty and contain only letters, digits, '-' or '_'",
                self.deployment
            )));
        }

        match self.launcher.as_str() {
            "docker" | "process" => {}
            other => return Err(ConfigError::InvalidLauncher(other.to_string())),
        }
        self.routing_format()?;

        if self.health_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "Health max attempts must be at least 1".to_string(),
            ));
        }
        if self.health_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "Health interval must be at least 1ms".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 || self.probe_timeout_secs > 300 {
            return Err(ConfigError::ValidationFailed(
                "Probe timeout must be between 1 and 300 seconds".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    pub fn routing_format(&self) -> Result<RoutingFormat, ConfigError> {
        self.routing_format
            .parse()
            .map_err(|_| ConfigError::InvalidRoutingFormat(self.routing_format.clone()))
    }

    pub fn routing_path(&self) -> PathBuf {
        self.routing_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("routing.json"))
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("backups"))
    }

    /// PID and log files of the process launcher
    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("run").join(&self.deployment)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn create_launcher(&self) -> Result<Arc<dyn Launcher>, LaunchError> {
        match self.launcher.as_str() {
            "process" => Ok(Arc::new(ProcessLauncher::new(self.run_dir()))),
            "docker" => Ok(Arc::new(DockerLauncher::new(
                &self.deployment,
                self.docker_network.clone(),
            )?)),
            other => Err(LaunchError::Unavailable(format!(
                "Unknown launcher '{}'",
                other
            ))),
        }
    }

    pub fn create_routing_store(&self) -> Result<Arc<dyn RoutingStore>, ConfigError> {
        let mut store = FileRoutingStore::new(self.routing_path(), self.routing_format()?);
        if let Some(command) = &self.routing_reload {
            store = store.with_reload(command);
        }
        Ok(Arc::new(store))
    }

    pub fn to_display_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert("deployment".to_string(), self.deployment.clone());
        map.insert("catalog".to_string(), self.catalog_path.display().to_string());
        map.insert("state_dir".to_string(), self.state_dir.display().to_string());
        map.insert("launcher".to_string(), self.launcher.clone());
        if let Some(ref network) = self.docker_network {
            map.insert("docker_network".to_string(), network.clone());
        }
        map.insert(
            "health_max_attempts".to_string(),
            self.health_max_attempts.to_string(),
        );
        map.insert(
            "health_interval_ms".to_string(),
            self.health_interval_ms.to_string(),
        );
        map.insert(
            "probe_timeout_secs".to_string(),
            self.probe_timeout_secs.to_string(),
        );
        map.insert(
            "stop_timeout_secs".to_string(),
            self.stop_timeout_secs.to_string(),
        );
        map.insert(
            "routing_file".to_string(),
            self.routing_path().display().to_string(),
        );
        map.insert("routing_format".to_string(), self.routing_format.clone());
        if let Some(ref reload) = self.routing_reload {
            map.insert("routing_reload".to_string(), reload.clone());
        }
        map.insert(
            "backup_dir".to_string(),
            self.backup_path().display().to_string(),
        );
        map.insert("log_level".to_string(), self.log_level.clone());

        map
    }
}

impl fmt::Display for OrchestratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Orchestrator Configuration:")?;
        writeln!(f, "  Deployment: {}", self.deployment)?;
        writeln!(f, "  Catalog: {}", self.catalog_path.display())?;
        writeln!(f, "  State Dir: {}", self.state_dir.display())?;
        writeln!(f, "  Launcher: {}", self.launcher)?;
        if let Some(ref network) = self.docker_network {
            writeln!(f, "  Docker Network: {}", network)?;
        }
        writeln!(
            f,
            "  Health Gate: {} attempts every {}ms",
            self.health_max_attempts, self.health_interval_ms
        )?;
        writeln!(f, "  Probe Timeout: {}s", self.probe_timeout_secs)?;
        writeln!(f, "  Stop Timeout: {}s", self.stop_timeout_secs)?;
        writeln!(
            f,
            "  Routing: {} ({})",
            self.routing_path().display(),
            self.routing_format
        )?;
        writeln!(f, "  Backups: {}", self.backup_path().display())?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}
