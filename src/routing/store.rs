use super::{RouteTarget, RoutingConfig, RoutingError};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Where the live routing table is published for the gateway
#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn write(&self, config: &RoutingConfig) -> Result<(), RoutingError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingFormat {
    #[default]
    Json,
    /// `KEY=value` lines: `ENABLE_PROXY_MODE` plus one `USE_<ROUTE>_SERVICE`
    Env,
}

impl FromStr for RoutingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(RoutingFormat::Json),
            "env" => Ok(RoutingFormat::Env),
            other => Err(format!("Invalid routing format: {}. Valid options: json, env", other)),
        }
    }
}

/// `auth` -> `USE_AUTH_SERVICE`, `sample-api` -> `USE_SAMPLE_API_SERVICE`
pub fn env_flag_name(route: &str) -> String {
    let normalized: String = route
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("USE_{}_SERVICE", normalized)
}

pub fn render_env(config: &RoutingConfig) -> String {
    let mut out = String::from("# Managed by orchestrator; do not edit\n");
    out.push_str(&format!("ENABLE_PROXY_MODE={}\n", config.proxy_mode_enabled));
    for (route, target) in &config.routes {
        out.push_str(&format!(
            "{}={}\n",
            env_flag_name(route),
            *target == RouteTarget::Microservice
        ));
    }
    out
}

pub struct FileRoutingStore {
    path: PathBuf,
    format: RoutingFormat,
    reload_command: Option<String>,
}

impl FileRoutingStore {
    pub fn new(path: impl Into<PathBuf>, format: RoutingFormat) -> Self {
        Self {
            path: path.into(),
            format,
            reload_command: None,
        }
    }

    pub fn with_reload(mut self, command: impl Into<String>) -> Self {
        self.reload_command = Some(command.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self, config: &RoutingConfig) -> Result<String, RoutingError> {
        match self.format {
            RoutingFormat::Json => serde_json::to_string_pretty(config)
                .map(|json| json + "\n")
                .map_err(|e| RoutingError::Serialize(e.to_string())),
            RoutingFormat::Env => Ok(render_env(config)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> RoutingError {
        RoutingError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Temp file in the same directory, fsync, rename over the live file
    fn write_atomic(&self, content: &str) -> Result<(), RoutingError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "routing".to_string());
        let tmp = dir.join(format!(".{}.tmp", file_name));

        let mut file = std::fs::File::create(&tmp).map_err(|e| self.io_error(e))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| self.io_error(e))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            self.io_error(e)
        })
    }

    fn read_previous(&self) -> Result<Option<String>, RoutingError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Puts the previous table back (or removes the file if there was none)
    /// and reloads it.
    async fn revert(&self, previous: Option<&str>, command: &str) {
        let restored = match previous {
            Some(content) => self.write_atomic(content),
            None => match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(self.io_error(e)),
            },
        };
        match restored {
            Ok(()) => warn!(path = %self.path.display(), "Reload failed, previous routing restored"),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Reload failed and previous routing could not be restored");
                return;
            }
        }
        if previous.is_some() {
            if let Err(e) = self.reload(command).await {
                warn!(error = %e, "Reload of the restored routing failed");
            }
        }
    }

    async fn reload(&self, command: &str) -> Result<(), RoutingError> {
        debug!(command = %command, "Running routing reload hook");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| RoutingError::ReloadFailed {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RoutingError::ReloadFailed {
                command: command.to_string(),
                reason: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

#[async_trait]
impl RoutingStore for FileRoutingStore {
    async fn write(&self, config: &RoutingConfig) -> Result<(), RoutingError> {
        let content = self.render(config)?;
        let previous = self.read_previous()?;
        self.write_atomic(&content)?;
        info!(
            path = %self.path.display(),
            proxy_mode = config.proxy_mode_enabled,
            "Routing configuration written"
        );

        let Some(command) = &self.reload_command else {
            return Ok(());
        };
        if let Err(error) = self.reload(command).await {
            self.revert(previous.as_deref(), command).await;
            return Err(error);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let format = match self.format {
            RoutingFormat::Json => "json",
            RoutingFormat::Env => "env",
        };
        format!("{} ({})", self.path.display(), format)
    }
}

/// Keeps the last written table in memory
#[derive(Default)]
pub struct MemoryRoutingStore {
    current: Mutex<Option<RoutingConfig>>,
    writes: Mutex<usize>,
    fail: Mutex<bool>,
}

impl MemoryRoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    pub fn current(&self) -> Option<RoutingConfig> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RoutingStore for MemoryRoutingStore {
    async fn write(&self, config: &RoutingConfig) -> Result<(), RoutingError> {
        if *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(RoutingError::Rejected("memory store set to fail".to_string()));
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
