//! Persisted phase record
//!
//! One JSON document per deployment at `<state_dir>/<deployment>.json`, written
//! atomically after every transition. Writers hold a [`TransitionLock`] on
//! `<state_dir>/<deployment>.lock` so two CLI invocations never interleave.

pub mod phase;

pub use phase::MigrationPhase;

use crate::backup::BackupRecord;
use crate::health::HealthStatus;
use crate::launcher::Handle;
use crate::routing::RoutingConfig;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Deployment '{deployment}' is locked by another orchestrator ({path})")]
    Locked { deployment: String, path: PathBuf },

    #[error("Cannot reset deployment in phase {0}; roll back first")]
    ResetRefused(MigrationPhase),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    pub health: HealthStatus,
    pub tier: u32,
}

/// Difference between what runs and what the current phase requires
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    /// Running but not required
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphaned: Vec<String>,
    /// Required but not running
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl Drift {
    pub fn between(running: &BTreeSet<String>, required: &BTreeSet<String>) -> Self {
        Self {
            orphaned: running.difference(required).cloned().collect(),
            missing: required.difference(running).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub deployment: String,
    pub phase: MigrationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<MigrationPhase>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceState>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    #[serde(default)]
    pub drift: Drift,
    /// Backup whose restore failed during the last rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_restore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseState {
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            phase: MigrationPhase::Uninitialized,
            rolled_back_from: None,
            services: BTreeMap::new(),
            routing: RoutingConfig::default(),
            backups: Vec::new(),
            drift: Drift::default(),
            pending_restore: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Services with a recorded handle
    pub fn running_names(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .filter(|(_, s)| s.handle.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn handle(&self, service: &str) -> Option<&Handle> {
        self.services.get(service).and_then(|s| s.handle.as_ref())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Exclusive cross-process lock, released on drop
#[derive(Debug)]
pub struct TransitionLock {
    file: File,
    path: PathBuf,
}

impl TransitionLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransitionLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "Failed to release transition lock");
        }
    }
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, deployment: &str) -> PathBuf {
        self.dir.join(format!("{}.json", deployment))
    }

    pub fn lock_path(&self, deployment: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", deployment))
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
        move |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// `None` when the deployment has never been prepared
    pub fn load(&self, deployment: &str) -> Result<Option<PhaseState>, StateError> {
        let path = self.state_path(deployment);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&path)(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    pub fn load_or_new(&self, deployment: &str) -> Result<PhaseState, StateError> {
        Ok(self
            .load(deployment)?
            .unwrap_or_else(|| PhaseState::new(deployment)))
    }

    pub fn save(&self, state: &PhaseState) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir).map_err(Self::io_error(&self.dir))?;
        let path = self.state_path(&state.deployment);
        let tmp = self.dir.join(format!(".{}.json.tmp", state.deployment));

        let json = serde_json::to_string_pretty(state).map_err(|e| StateError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut file = File::create(&tmp).map_err(Self::io_error(&tmp))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(Self::io_error(&tmp))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(Self::io_error(&path))?;

        debug!(deployment = %state.deployment, phase = %state.phase, "State saved");
        Ok(())
    }

    /// Removes the phase record; allowed only before a rollout or after a rollback
    pub fn delete(&self, deployment: &str) -> Result<bool, StateError> {
        if let Some(state) = self.load(deployment)? {
            if !matches!(
                state.phase,
                MigrationPhase::Uninitialized | MigrationPhase::RolledBack
            ) {
                return Err(StateError::ResetRefused(state.phase));
            }
        }

        let path = self.state_path(deployment);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(deployment = %deployment, "Phase record deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path)(e)),
        }
    }

    /// Fails fast with `Locked` when another process holds the lock
    pub fn lock(&self, deployment: &str) -> Result<TransitionLock, StateError> {
        fs::create_dir_all(&self.dir).map_err(Self::io_error(&self.dir))?;
        let path = self.lock_path(deployment);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(Self::io_error(&path))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(TransitionLock { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(StateError::Locked {
                deployment: deployment.to_string(),
                path,
            }),
            Err(e) => Err(Self::io_error(&path)(e)),
        }
    }
}
