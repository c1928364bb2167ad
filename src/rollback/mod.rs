//! Rollback controller
//!
//! Returns a deployment to its legacy baseline from any phase after
//! `Uninitialized`:
//!
//! 1. re-establish the `Prepared` services (monolith) if they are not running
//! 2. flip every route back to legacy
//! 3. stop every service the baseline does not need
//! 4. restore the newest complete backup taken at or before the phase being
//!    rolled back from
//! 5. record `RolledBack`
//!
//! A restore failure does not undo steps 2 and 3; the phase is still recorded
//! and the error is returned afterwards so the operator sees it.

pub mod checklist;

pub use checklist::{Checklist, ChecklistStep};

use crate::backup::{latest_restorable, BackupRecord, RestoreSummary};
use crate::catalog::ServiceSpec;
use crate::context::RolloutContext;
use crate::controller::tiers::{self, BringUp};
use crate::error::OrchestratorError;
use crate::progress::ProgressEvent;
use crate::routing::RoutingConfig;
use crate::state::{Drift, MigrationPhase, PhaseState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// Phase the deployment was rolled back from
    pub from: MigrationPhase,
    /// Baseline services that had to be started again
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSummary>,
    pub routing: RoutingConfig,
    pub drift: Drift,
    pub duration_ms: u128,
}

pub struct RollbackController {
    ctx: Arc<RolloutContext>,
}

impl RollbackController {
    pub fn new(ctx: Arc<RolloutContext>) -> Self {
        Self { ctx }
    }

    /// Rolls back the current phase. With `force` services that refuse to
    /// stop are left behind instead of aborting the rollback.
    pub async fn rollback(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RollbackReport, OrchestratorError> {
        let ctx = &self.ctx;
        let started_at = Instant::now();
        let (_guard, mut state) = ctx.begin().await?;
        let current = state.phase;

        if !current.can_roll_back() {
            return Err(OrchestratorError::InvalidTransition {
                from: current,
                to: MigrationPhase::RolledBack,
            });
        }
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        ctx.launcher
            .check_available()
            .await
            .map_err(|e| OrchestratorError::Prerequisite(e.to_string()))?;

        // Repeating a rollback re-applies routing and stops, but only redoes
        // the restore when the previous one failed.
        let from = match current {
            MigrationPhase::RolledBack => state.rolled_back_from.unwrap_or(MigrationPhase::Prepared),
            other => other,
        };
        let backup = self.select_backup(&state, current, from);

        info!(deployment = %ctx.deployment, from = %from, force, "Rollback started");
        ctx.emit(ProgressEvent::RollbackStarted { from });

        let restarted = self.restore_baseline(&mut state, cancel).await?;

        let legacy = RoutingConfig::legacy(&ctx.catalog);
        if let Err(e) = ctx.router.set_routing(&legacy).await {
            ctx.emit(ProgressEvent::RollbackStep {
                step: "routing".to_string(),
                ok: false,
            });
            return Err(self.abort(&mut state, e.into()));
        }
        state.routing = legacy;
        ctx.persist(&mut state)?;
        ctx.emit(ProgressEvent::RollbackStep {
            step: "routing".to_string(),
            ok: true,
        });

        let baseline = ctx.catalog.required_names(MigrationPhase::Prepared);
        let running = tiers::observe_running(ctx, &mut state).await;
        let to_stop: Vec<String> = running.difference(&baseline).cloned().collect();
        let teardown = tiers::tear_down(ctx, &to_stop, &mut state, cancel).await;
        ctx.emit(ProgressEvent::RollbackStep {
            step: "stop".to_string(),
            ok: teardown.failed.is_empty() && !teardown.cancelled,
        });
        if teardown.cancelled {
            return Err(self.abort(&mut state, OrchestratorError::Cancelled));
        }
        if !teardown.failed.is_empty() {
            let services: Vec<String> = teardown.failed.keys().cloned().collect();
            if !force {
                return Err(self.abort(&mut state, OrchestratorError::RollbackStopFailed { services }));
            }
            warn!(services = ?services, "Services left running because of --force");
        }

        let mut restore_error = None;
        let mut restore = None;
        if let Some(record) = backup {
            match ctx.backups.restore(&record, ctx.catalog.resources()).await {
                Ok(summary) => {
                    state.pending_restore = None;
                    restore = Some(summary);
                }
                Err(e) => {
                    warn!(backup = %record.id, error = %e, "Restore failed");
                    state.pending_restore = Some(record.id.clone());
                    restore_error = Some(e);
                }
            }
            ctx.emit(ProgressEvent::RollbackStep {
                step: format!("restore {}", record.id),
                ok: restore_error.is_none(),
            });
        } else {
            info!(from = %from, "No restorable backup, skipping restore");
        }

        state.phase = MigrationPhase::RolledBack;
        state.rolled_back_from = Some(from);
        let live = tiers::observe_running(ctx, &mut state).await;
        state.drift = Drift::between(&live, &baseline);
        state.last_error = restore_error.as_ref().map(|e| e.to_string());
        ctx.persist(&mut state)?;

        let duration = started_at.elapsed();
        ctx.emit(ProgressEvent::RollbackComplete {
            total_time: duration,
        });

        if let Some(e) = restore_error {
            return Err(e.into());
        }

        Ok(RollbackReport {
            from,
            restarted,
            stopped: teardown.stopped,
            stop_failures: teardown.failed.into_keys().collect(),
            restore,
            routing: state.routing.clone(),
            drift: state.drift.clone(),
            duration_ms: duration.as_millis(),
        })
    }

    fn select_backup(
        &self,
        state: &PhaseState,
        current: MigrationPhase,
        from: MigrationPhase,
    ) -> Option<BackupRecord> {
        if current == MigrationPhase::RolledBack {
            let pending = state.pending_restore.as_ref()?;
            return state.backups.iter().find(|b| &b.id == pending).cloned();
        }
        latest_restorable(&state.backups, from).cloned()
    }

    /// Starts baseline services that are not running, e.g. a monolith retired
    /// in a later phase. Failures are logged; the rollback carries on.
    async fn restore_baseline(
        &self,
        state: &mut PhaseState,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, OrchestratorError> {
        let ctx = &self.ctx;
        let running = tiers::observe_running(ctx, state).await;
        let missing: Vec<&ServiceSpec> = ctx
            .catalog
            .services_for_phase(MigrationPhase::Prepared)
            .into_iter()
            .filter(|s| !running.contains(&s.name))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<String> = missing.iter().map(|s| s.name.clone()).collect();
        info!(services = ?names, "Restarting baseline services");
        let ok = match tiers::bring_up(ctx, &missing, state, cancel).await? {
            BringUp::Complete => true,
            BringUp::Failed(failed) => {
                warn!(failed = ?failed, "Baseline services did not come up; continuing rollback");
                false
            }
            BringUp::Cancelled => return Err(self.abort(state, OrchestratorError::Cancelled)),
        };
        ctx.emit(ProgressEvent::RollbackStep {
            step: "baseline".to_string(),
            ok,
        });
        Ok(names)
    }

    fn abort(&self, state: &mut PhaseState, error: OrchestratorError) -> OrchestratorError {
        state.last_error = Some(error.to_string());
        if let Err(e) = self.ctx.persist(state) {
            warn!(error = %e, "Failed to record rollback failure");
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MockBackupTool;
    use crate::catalog::{Catalog, HealthCheck};
    use crate::health::ScriptedProber;
    use crate::launcher::{Launcher, MockLauncher};
    use crate::routing::MemoryRoutingStore;
    use tempfile::TempDir;

    fn context(dir: &TempDir, launcher: &Arc<MockLauncher>) -> Arc<RolloutContext> {
        let services = vec![
            ServiceSpec::new("monolith", 0, "monolith")
                .with_health(HealthCheck::http("http://monolith/health"))
                .in_phases([MigrationPhase::Prepared, MigrationPhase::Phase1]),
            ServiceSpec::new("auth", 1, "auth")
                .with_health(HealthCheck::http("http://auth/health"))
                .in_phases([MigrationPhase::Phase1])
                .serving("auth"),
        ];
        Arc::new(
            RolloutContext::new(
                "lab",
                Arc::new(Catalog::with_services(services).unwrap()),
                launcher.clone(),
                Arc::new(ScriptedProber::new()),
                Arc::new(MockBackupTool::new()),
                dir.path().join("backups"),
                Arc::new(MemoryRoutingStore::new()),
                dir.path(),
                crate::context::RolloutSettings {
                    max_attempts: 2,
                    interval: std::time::Duration::from_millis(1),
                    stop_timeout: std::time::Duration::from_secs(1),
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_rollback_from_uninitialized_is_rejected() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let controller = RollbackController::new(context(&dir, &launcher));

        let err = controller
            .rollback(false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                from: MigrationPhase::Uninitialized,
                to: MigrationPhase::RolledBack
            }
        ));
    }

    #[tokio::test]
    async fn test_rollback_restarts_missing_baseline() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let ctx = context(&dir, &launcher);
        {
            let (_guard, mut state) = ctx.begin().await.unwrap();
            state.phase = MigrationPhase::Phase1;
            ctx.persist(&mut state).unwrap();
        }

        let report = RollbackController::new(ctx.clone())
            .rollback(false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.from, MigrationPhase::Phase1);
        assert_eq!(report.restarted, vec!["monolith"]);
        assert!(report.routing.is_fully_legacy());
        assert!(launcher.running().contains("monolith"));
        assert_eq!(ctx.snapshot().phase, MigrationPhase::RolledBack);
    }

    #[tokio::test]
    async fn test_stop_failure_aborts_without_force() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let ctx = context(&dir, &launcher);
        {
            let (_guard, mut state) = ctx.begin().await.unwrap();
            state.phase = MigrationPhase::Phase1;
            let auth = ctx.catalog.service("auth").unwrap();
            let handle = launcher.start(auth).await.unwrap();
            state.services.insert(
                "auth".to_string(),
                crate::state::ServiceState {
                    handle: Some(handle),
                    health: crate::health::HealthStatus::Healthy,
                    tier: 1,
                },
            );
            ctx.persist(&mut state).unwrap();
        }
        launcher.fail_stop_of("auth");
        let controller = RollbackController::new(ctx.clone());

        let err = controller
            .rollback(false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RollbackStopFailed { .. }));
        assert_eq!(ctx.snapshot().phase, MigrationPhase::Phase1);

        let report = controller
            .rollback(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.stop_failures, vec!["auth"]);
        assert_eq!(report.drift.orphaned, vec!["auth"]);
        assert_eq!(ctx.snapshot().phase, MigrationPhase::RolledBack);
    }
}
