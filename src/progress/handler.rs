//! Progress handler trait and events

use crate::health::HealthStatus;
use crate::state::MigrationPhase;
use std::time::Duration;

/// Events emitted while a transition or rollback runs
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Transition accepted and lock held
    TransitionStarted {
        from: MigrationPhase,
        to: MigrationPhase,
        to_start: usize,
        to_stop: usize,
    },

    /// Pre-transition snapshot written
    BackupCreated {
        id: String,
        resources: usize,
        partial: bool,
    },

    /// Services of one tier are being started
    TierStarted {
        tier: u32,
        index: usize,
        total: usize,
        services: Vec<String>,
    },

    /// Launcher returned a handle
    ServiceStarted { service: String, handle: String },

    /// Health gate finished for a service
    ServiceHealth {
        service: String,
        status: HealthStatus,
        elapsed: Duration,
    },

    /// Launch failed before the health gate ran
    ServiceFailed { service: String, error: String },

    RoutingApplied {
        proxy_mode_enabled: bool,
        migrated_routes: usize,
    },

    ServiceStopped { service: String },

    TransitionComplete {
        phase: MigrationPhase,
        total_time: Duration,
    },

    TransitionFailed {
        target: MigrationPhase,
        error: String,
    },

    RollbackStarted { from: MigrationPhase },

    /// A rollback step finished; `ok` is false when it failed but the
    /// rollback continued
    RollbackStep { step: String, ok: bool },

    RollbackComplete { total_time: Duration },
}

/// Trait for handling progress events during transitions
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}
