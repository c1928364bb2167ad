//! Process/container launcher abstraction
//!
//! A launcher starts and stops named services and hands back a [`Handle`] that
//! is persisted in the phase record, so a later invocation of the CLI can still
//! control a service started by an earlier one.
//!
//! Start failures are reported and never retried here; retry policy belongs to
//! the phase controller.

pub mod docker;
pub mod mock;
pub mod process;

pub use docker::DockerLauncher;
pub use mock::MockLauncher;
pub use process::ProcessLauncher;

use crate::catalog::ServiceSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reference to a started service: a container id or a PID with its start time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub service: String,
    pub id: String,
}

impl Handle {
    pub fn new(service: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.id)
    }
}

#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    #[error("Launcher backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to start '{service}': {reason}")]
    StartFailed { service: String, reason: String },

    #[error("Failed to stop '{service}': {reason}")]
    StopFailed { service: String, reason: String },

    #[error("Invalid handle {handle}: {reason}")]
    InvalidHandle { handle: String, reason: String },
}

impl LaunchError {
    pub fn start_failed(service: &str, reason: impl fmt::Display) -> Self {
        LaunchError::StartFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn stop_failed(service: &str, reason: impl fmt::Display) -> Self {
        LaunchError::StopFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            LaunchError::StartFailed { service, .. } | LaunchError::StopFailed { service, .. } => {
                Some(service)
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts `spec`, or returns the handle of the instance already running
    /// under the same name.
    async fn start(&self, spec: &ServiceSpec) -> Result<Handle, LaunchError>;

    /// Graceful stop, force-kill after `timeout`. Stopping an already stopped
    /// handle succeeds.
    async fn stop(&self, handle: &Handle, timeout: Duration) -> Result<(), LaunchError>;

    async fn is_running(&self, handle: &Handle) -> bool;

    /// Verifies the backend itself is reachable
    async fn check_available(&self) -> Result<(), LaunchError>;

    fn name(&self) -> &str;
}
