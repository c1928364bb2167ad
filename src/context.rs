//! Rollout context owning every long-lived collaborator

use crate::backup::{BackupManager, BackupTool, LocalBackupTool};
use crate::catalog::Catalog;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::health::{HealthGate, HttpProber, Prober};
use crate::launcher::Launcher;
use crate::progress::{ProgressEvent, ProgressHandler};
use crate::routing::{RoutingStore, TrafficRouter};
use crate::state::{PhaseState, StateError, StateStore, TransitionLock};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::MutexGuard;

/// Health gate and stop tuning shared by both controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    pub max_attempts: u32,
    pub interval: Duration,
    pub stop_timeout: Duration,
}

impl RolloutSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.health_max_attempts,
            interval: config.health_interval(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Held for the whole of a transition or rollback
pub struct TransitionGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: TransitionLock,
}

pub struct RolloutContext {
    pub deployment: String,
    pub catalog: Arc<Catalog>,
    pub launcher: Arc<dyn Launcher>,
    pub gate: HealthGate,
    pub backups: BackupManager,
    pub router: TrafficRouter,
    pub store: StateStore,
    pub settings: RolloutSettings,
    progress: Option<Arc<dyn ProgressHandler>>,
    lock: tokio::sync::Mutex<()>,
    published: RwLock<PhaseState>,
}

impl RolloutContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployment: impl Into<String>,
        catalog: Arc<Catalog>,
        launcher: Arc<dyn Launcher>,
        prober: Arc<dyn Prober>,
        backup_tool: Arc<dyn BackupTool>,
        backup_dir: impl Into<PathBuf>,
        routing_store: Arc<dyn RoutingStore>,
        state_dir: impl Into<PathBuf>,
        settings: RolloutSettings,
    ) -> Result<Self, StateError> {
        let deployment = deployment.into();
        let store = StateStore::new(state_dir);
        let state = store.load_or_new(&deployment)?;

        Ok(Self {
            deployment,
            catalog,
            launcher,
            gate: HealthGate::new(prober),
            backups: BackupManager::new(backup_dir, backup_tool),
            router: TrafficRouter::new(routing_store),
            store,
            settings,
            progress: None,
            lock: tokio::sync::Mutex::new(()),
            published: RwLock::new(state),
        })
    }

    /// Real collaborators as selected by `config`
    pub fn from_config(config: &OrchestratorConfig, catalog: Catalog) -> Result<Self, OrchestratorError> {
        let launcher = config.create_launcher()?;
        let routing_store = config.create_routing_store()?;
        let context = Self::new(
            &config.deployment,
            Arc::new(catalog),
            launcher,
            Arc::new(HttpProber::new(config.probe_timeout())),
            Arc::new(LocalBackupTool::new()),
            config.backup_path(),
            routing_store,
            &config.state_dir,
            RolloutSettings::from_config(config),
        )?;
        Ok(context)
    }

    pub fn with_progress(mut self, handler: Arc<dyn ProgressHandler>) -> Self {
        self.progress = Some(handler);
        self
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(handler) = &self.progress {
            handler.on_progress(&event);
        }
    }

    /// Last published phase record; never blocks on a running transition
    pub fn snapshot(&self) -> PhaseState {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, state: &PhaseState) {
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state.clone();
    }

    /// Takes the in-process and cross-process locks, then re-reads the phase
    /// record so changes made by another invocation are seen.
    pub async fn begin(&self) -> Result<(TransitionGuard<'_>, PhaseState), StateError> {
        let local = self.lock.lock().await;
        let file = self.store.lock(&self.deployment)?;
        let state = self.store.load_or_new(&self.deployment)?;
        self.publish(&state);
        Ok((
            TransitionGuard {
                _local: local,
                _file: file,
            },
            state,
        ))
    }

    /// Saves and publishes `state`; callers must hold a [`TransitionGuard`]
    pub fn persist(&self, state: &mut PhaseState) -> Result<(), StateError> {
        state.touch();
        self.store.save(state)?;
        self.publish(state);
        Ok(())
    }

    /// Re-reads the record from disk without locking, for read-only commands
    pub fn refresh(&self) -> Result<PhaseState, StateError> {
        let state = self.store.load_or_new(&self.deployment)?;
        self.publish(&state);
        Ok(state)
    }
}
