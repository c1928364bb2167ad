//! Top-level error and exit-code mapping

use crate::backup::{BackupError, RestoreError};
use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::launcher::LaunchError;
use crate::routing::RoutingError;
use crate::state::{MigrationPhase, StateError};
use std::collections::BTreeMap;
use thiserror::Error;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PREREQUISITE: i32 = 1;
pub const EXIT_TRANSITION_FAILED: i32 = 2;
pub const EXIT_BACKUP_FAILED: i32 = 3;
pub const EXIT_RESTORE_FAILED: i32 = 4;
pub const EXIT_INVALID_TRANSITION: i32 = 5;
pub const EXIT_ROUTING_FAILED: i32 = 6;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Prerequisite not met: {0}")]
    Prerequisite(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: MigrationPhase,
        to: MigrationPhase,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Transition to {target} failed: {}", format_failed(.failed))]
    TransitionFailed {
        target: MigrationPhase,
        /// Failing service -> health status or launch error
        failed: BTreeMap<String, String>,
    },

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("Rollback could not stop: {}", .services.join(", "))]
    RollbackStopFailed { services: Vec<String> },

    #[error("Operation cancelled")]
    Cancelled,
}

fn format_failed(failed: &BTreeMap<String, String>) -> String {
    failed
        .iter()
        .map(|(service, reason)| format!("{} ({})", service, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl OrchestratorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Config(_)
            | OrchestratorError::Catalog(_)
            | OrchestratorError::State(_)
            | OrchestratorError::Prerequisite(_)
            | OrchestratorError::Launch(LaunchError::Unavailable(_)) => EXIT_PREREQUISITE,
            OrchestratorError::Launch(_)
            | OrchestratorError::TransitionFailed { .. }
            | OrchestratorError::RollbackStopFailed { .. } => EXIT_TRANSITION_FAILED,
            OrchestratorError::Backup(_) => EXIT_BACKUP_FAILED,
            OrchestratorError::Restore(_) => EXIT_RESTORE_FAILED,
            OrchestratorError::InvalidTransition { .. } => EXIT_INVALID_TRANSITION,
            OrchestratorError::Routing(_) => EXIT_ROUTING_FAILED,
            OrchestratorError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Names of the services that caused the failure, if any
    pub fn failed_services(&self) -> Vec<String> {
        match self {
            OrchestratorError::TransitionFailed { failed, .. } => failed.keys().cloned().collect(),
            OrchestratorError::RollbackStopFailed { services } => services.clone(),
            OrchestratorError::Launch(e) => e.service().map(str::to_string).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Returns a user-friendly error message with troubleshooting hints
    pub fn help_message(&self) -> String {
        match self {
            OrchestratorError::Config(e) => format!(
                "Error: Invalid configuration\n\n\
                Help: Check the ROLLOUT_* environment variables.\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::Catalog(e) => format!(
                "Error: Service catalog rejected\n\n\
                Help: Fix the catalog file (--catalog or ROLLOUT_CATALOG).\n\
                No service has been touched.\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::State(StateError::Locked { deployment, path }) => format!(
                "Error: Deployment '{}' is busy\n\n\
                Help: Another orchestrator holds {}.\n\
                Wait for it to finish; the lock is released when that process exits.",
                deployment,
                path.display()
            ),
            OrchestratorError::State(e) => format!(
                "Error: Phase record unavailable\n\n\
                Help: Check permissions on the state directory (--state-dir).\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::Prerequisite(msg) | OrchestratorError::Launch(LaunchError::Unavailable(msg)) => {
                format!(
                    "Error: Launcher backend unavailable\n\n\
                    Help: For the docker launcher make sure the daemon is running\n\
                    (docker info). For local processes set ROLLOUT_LAUNCHER=process.\n\n\
                    Details: {}",
                    msg
                )
            }
            OrchestratorError::InvalidTransition { from, to } => {
                let next = from
                    .successor()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "none (final phase)".to_string());
                format!(
                    "Error: Cannot move from {} to {}\n\n\
                    Help: Phases advance one step at a time. Next allowed phase: {}.\n\
                    Nothing was changed.",
                    from, to, next
                )
            }
            OrchestratorError::Launch(e) => format!(
                "Error: Service failed to launch\n\n\
                Help: Check the image or binary and that its ports are free.\n\
                Services already started are left running; run `orchestrator rollback`\n\
                to return to the legacy baseline.\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::TransitionFailed { target, failed } => format!(
                "Error: Transition to {} did not complete\n\n\
                Failed services: {}\n\n\
                Help: Routing was not changed and healthy services are still running.\n\
                Inspect the failing services, then retry the phase or run\n\
                `orchestrator rollback`.",
                target,
                format_failed(failed)
            ),
            OrchestratorError::Backup(e) => format!(
                "Error: Pre-transition backup failed\n\n\
                Help: No service was started. Fix the backup or rerun with --force\n\
                to proceed without a complete backup.\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::Routing(e) => format!(
                "Error: Routing update failed\n\n\
                Help: The phase was not advanced. Check the routing file and reload hook\n\
                (ROLLOUT_ROUTING_FILE, ROLLOUT_ROUTING_RELOAD).\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::Restore(e) => format!(
                "Error: Backup restore failed\n\n\
                Help: Traffic is back on the legacy implementation and the new services\n\
                are stopped. Restore the data manually; `orchestrator checklist` lists\n\
                the backups.\n\n\
                Details: {}",
                e
            ),
            OrchestratorError::RollbackStopFailed { services } => format!(
                "Error: Rollback could not stop {}\n\n\
                Help: Routing is already back on legacy. Stop the services manually or\n\
                rerun `orchestrator rollback --force` to finish the rollback anyway.",
                services.join(", ")
            ),
            OrchestratorError::Cancelled => "Operation cancelled. Actions already issued were not undone; \
                run `orchestrator status` to see where things stand."
                .to_string(),
        }
    }
}
