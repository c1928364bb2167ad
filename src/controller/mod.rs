//! Phase controller
//!
//! The state machine that moves a deployment forward one phase at a time:
//!
//! ```text
//! Uninitialized --prepare--> Prepared --phase1--> Phase1 --phase2--> Phase2 --phase3--> Phase3
//! RolledBack --prepare--> Prepared
//! ```
//!
//! A transition snapshots state for risky phases, brings up the missing
//! services tier by tier behind the health gate, flips routing, records the
//! new phase and only then stops services the phase no longer needs. Any
//! failure before the routing flip leaves the phase and routing untouched and
//! healthy services running; there is no automatic rollback.

pub mod tiers;

use crate::backup::BackupError;
use crate::catalog::{Catalog, ServiceSpec};
use crate::context::RolloutContext;
use crate::error::OrchestratorError;
use crate::health::HealthStatus;
use crate::progress::ProgressEvent;
use crate::rollback::Checklist;
use crate::routing::{RouteTarget, RoutingConfig};
use crate::state::{Drift, MigrationPhase, PhaseState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tiers::BringUp;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionOptions {
    /// Proceed past a failed or partial backup
    pub force: bool,
    /// Do not snapshot before a risky phase
    pub skip_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub tier: u32,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Required by the current phase
    pub required: bool,
}

/// Consistent view of a deployment for `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub deployment: String,
    /// None when the phase record could not be read
    pub phase: Option<MigrationPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<MigrationPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<MigrationPhase>,
    pub services: Vec<ServiceReport>,
    pub routing: RoutingConfig,
    pub drift: Drift,
    pub backups: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_backup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_restore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseReport {
    pub fn from_state(state: &PhaseState, catalog: &Catalog) -> Self {
        let required = catalog.required_names(state.phase);

        let mut services: Vec<ServiceReport> = state
            .services
            .iter()
            .map(|(name, service)| ServiceReport {
                name: name.clone(),
                tier: service.tier,
                health: service.health,
                handle: service.handle.as_ref().map(|h| h.id.clone()),
                required: required.contains(name),
            })
            .collect();
        for spec in catalog.services_for_phase(state.phase) {
            if !state.services.contains_key(&spec.name) {
                services.push(ServiceReport {
                    name: spec.name.clone(),
                    tier: spec.tier,
                    health: HealthStatus::Unknown,
                    handle: None,
                    required: true,
                });
            }
        }
        services.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));

        Self {
            deployment: state.deployment.clone(),
            phase: Some(state.phase),
            rolled_back_from: state.rolled_back_from,
            next_phase: state.phase.successor(),
            services,
            routing: state.routing.clone(),
            drift: state.drift.clone(),
            backups: state.backups.len(),
            latest_backup: state
                .backups
                .iter()
                .max_by(|a, b| a.created_at.cmp(&b.created_at))
                .map(|b| b.id.clone()),
            pending_restore: state.pending_restore.clone(),
            last_error: state.last_error.clone(),
            updated_at: state.updated_at,
        }
    }

    /// Report for a deployment whose phase record exists but cannot be read
    pub fn unreadable(deployment: &str, error: &str) -> Self {
        Self {
            deployment: deployment.to_string(),
            phase: None,
            rolled_back_from: None,
            next_phase: None,
            services: Vec::new(),
            routing: RoutingConfig::default(),
            drift: Drift::default(),
            backups: 0,
            latest_backup: None,
            pending_restore: None,
            last_error: Some(format!("phase record unreadable: {}", error)),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    pub routing: RoutingConfig,
    pub drift: Drift,
    pub duration_ms: u128,
}

pub struct PhaseController {
    ctx: Arc<RolloutContext>,
}

impl PhaseController {
    pub fn new(ctx: Arc<RolloutContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RolloutContext {
        &self.ctx
    }

    /// Enters `Prepared` from `Uninitialized` or `RolledBack`
    pub async fn prepare(
        &self,
        options: TransitionOptions,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport, OrchestratorError> {
        self.transition(MigrationPhase::Prepared, options, cancel)
            .await
    }

    pub fn status(&self) -> PhaseReport {
        PhaseReport::from_state(&self.ctx.snapshot(), &self.ctx.catalog)
    }

    pub fn checklist(&self) -> Checklist {
        Checklist::generate(&self.ctx.catalog, &self.ctx.snapshot())
    }

    /// Keeps the `keep` newest backup records and deletes the others with
    /// their storage. Returns the removed ids.
    pub async fn prune_backups(&self, keep: usize) -> Result<Vec<String>, OrchestratorError> {
        let ctx = &self.ctx;
        let (_guard, mut state) = ctx.begin().await?;
        let (kept, removed) = ctx.backups.prune(&state.backups, keep);
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        let removed: Vec<String> = removed.into_iter().map(|b| b.id).collect();
        if let Some(pending) = &state.pending_restore {
            if removed.contains(pending) {
                warn!(backup = %pending, "Pruned the backup of a pending restore");
                state.pending_restore = None;
            }
        }
        state.backups = kept;
        ctx.persist(&mut state)?;
        info!(removed = removed.len(), kept = state.backups.len(), "Backups pruned");
        Ok(removed)
    }

    /// Deletes the phase record. Only allowed before a rollout or after a
    /// rollback; returns false when there was no record. Backup records are
    /// carried into the fresh record so `prune` can still reach them.
    pub async fn reset(&self) -> Result<bool, OrchestratorError> {
        let ctx = &self.ctx;
        let (_guard, state) = ctx.begin().await?;
        let deleted = ctx.store.delete(&ctx.deployment)?;
        if state.backups.is_empty() {
            ctx.refresh()?;
            return Ok(deleted);
        }

        let mut fresh = PhaseState::new(&ctx.deployment);
        fresh.backups = state.backups;
        ctx.persist(&mut fresh)?;
        info!(
            deployment = %ctx.deployment,
            backups = fresh.backups.len(),
            "Phase record reset, backups kept"
        );
        Ok(true)
    }

    pub async fn transition(
        &self,
        target: MigrationPhase,
        options: TransitionOptions,
        cancel: &CancellationToken,
    ) -> Result<TransitionReport, OrchestratorError> {
        let ctx = &self.ctx;
        let started_at = Instant::now();
        let (_guard, mut state) = ctx.begin().await?;
        let from = state.phase;

        if target == MigrationPhase::RolledBack || !from.can_transition_to(target) {
            return Err(OrchestratorError::InvalidTransition { from, to: target });
        }
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        ctx.launcher
            .check_available()
            .await
            .map_err(|e| OrchestratorError::Prerequisite(e.to_string()))?;

        let running = tiers::observe_running(ctx, &mut state).await;
        let required = ctx.catalog.required_names(target);
        let to_start: Vec<&ServiceSpec> = ctx
            .catalog
            .services_for_phase(target)
            .into_iter()
            .filter(|s| !running.contains(&s.name))
            .collect();
        let to_stop: Vec<String> = running.difference(&required).cloned().collect();

        info!(
            deployment = %ctx.deployment,
            from = %from,
            to = %target,
            to_start = to_start.len(),
            to_stop = to_stop.len(),
            "Transition started"
        );
        ctx.emit(ProgressEvent::TransitionStarted {
            from,
            to: target,
            to_start: to_start.len(),
            to_stop: to_stop.len(),
        });

        let backup = self.backup_before(target, options, &mut state).await?;

        match tiers::bring_up(ctx, &to_start, &mut state, cancel).await? {
            BringUp::Complete => {}
            BringUp::Failed(failed) => {
                let error = OrchestratorError::TransitionFailed { target, failed };
                return Err(self.abort(&mut state, target, error));
            }
            BringUp::Cancelled => {
                return Err(self.abort(&mut state, target, OrchestratorError::Cancelled));
            }
        }

        let table = RoutingConfig::for_phase(&ctx.catalog, target);
        if let Err(e) = ctx.router.set_routing(&table).await {
            return Err(self.abort(&mut state, target, e.into()));
        }
        ctx.emit(ProgressEvent::RoutingApplied {
            proxy_mode_enabled: table.proxy_mode_enabled,
            migrated_routes: table
                .routes
                .values()
                .filter(|t| **t == RouteTarget::Microservice)
                .count(),
        });

        state.routing = table;
        state.phase = target;
        state.rolled_back_from = None;
        state.pending_restore = None;
        state.last_error = None;
        ctx.persist(&mut state)?;

        // Stop failures surface as drift rather than failing the transition
        let stopped = tiers::tear_down(ctx, &to_stop, &mut state, cancel).await.stopped;

        let live = tiers::observe_running(ctx, &mut state).await;
        state.drift = Drift::between(&live, &required);
        if !state.drift.is_empty() {
            warn!(
                orphaned = ?state.drift.orphaned,
                missing = ?state.drift.missing,
                "Drift detected after transition"
            );
        }
        ctx.persist(&mut state)?;

        let duration = started_at.elapsed();
        ctx.emit(ProgressEvent::TransitionComplete {
            phase: target,
            total_time: duration,
        });

        Ok(TransitionReport {
            from,
            to: target,
            started: to_start.iter().map(|s| s.name.clone()).collect(),
            stopped,
            backup,
            routing: state.routing.clone(),
            drift: state.drift.clone(),
            duration_ms: duration.as_millis(),
        })
    }

    /// Snapshot before a risky phase. Returns the backup id when one was taken.
    async fn backup_before(
        &self,
        target: MigrationPhase,
        options: TransitionOptions,
        state: &mut PhaseState,
    ) -> Result<Option<String>, OrchestratorError> {
        let ctx = &self.ctx;
        if !ctx.catalog.phase_plan(target).risky {
            return Ok(None);
        }
        if options.skip_backup {
            warn!(phase = %target, "Backup skipped for risky phase");
            return Ok(None);
        }

        let resources = ctx.catalog.backup_resources(target);
        let record = match ctx.backups.snapshot(&resources, state.phase).await {
            Ok(record) => record,
            Err(e) if options.force => {
                warn!(error = %e, "Backup failed, continuing because of --force");
                return Ok(None);
            }
            Err(e) => return Err(self.abort(state, target, e.into())),
        };

        ctx.emit(ProgressEvent::BackupCreated {
            id: record.id.clone(),
            resources: record.resources_included.len(),
            partial: record.partial,
        });
        let id = record.id.clone();
        let failed: Vec<String> = record.failed.keys().cloned().collect();
        state.backups.push(record);
        ctx.persist(state)?;

        if !failed.is_empty() {
            if options.force {
                warn!(backup = %id, "Backup is partial, continuing because of --force");
            } else {
                let error = BackupError::Partial {
                    id: id.clone(),
                    failed,
                };
                return Err(self.abort(state, target, error.into()));
            }
        }
        Ok(Some(id))
    }

    /// Records the failure without touching phase or routing
    fn abort(
        &self,
        state: &mut PhaseState,
        target: MigrationPhase,
        error: OrchestratorError,
    ) -> OrchestratorError {
        state.last_error = Some(error.to_string());
        if let Err(e) = self.ctx.persist(state) {
            warn!(error = %e, "Failed to record transition failure");
        }
        self.ctx.emit(ProgressEvent::TransitionFailed {
            target,
            error: error.to_string(),
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MockBackupTool;
    use crate::catalog::{HealthCheck, ServiceSpec};
    use crate::health::ScriptedProber;
    use crate::launcher::MockLauncher;
    use crate::routing::MemoryRoutingStore;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        launcher: Arc<MockLauncher>,
        prober: Arc<ScriptedProber>,
        controller: PhaseController,
    }

    fn service(name: &str, tier: u32, phases: &[MigrationPhase]) -> ServiceSpec {
        ServiceSpec::new(name, tier, name)
            .with_health(HealthCheck::http(format!("http://{}/health", name)))
            .in_phases(phases.iter().copied())
    }

    fn harness(services: Vec<ServiceSpec>) -> Harness {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let prober = Arc::new(ScriptedProber::new());
        let ctx = RolloutContext::new(
            "lab",
            Arc::new(Catalog::with_services(services).unwrap()),
            launcher.clone(),
            prober.clone(),
            Arc::new(MockBackupTool::new()),
            dir.path().join("backups"),
            Arc::new(MemoryRoutingStore::new()),
            dir.path(),
            crate::context::RolloutSettings {
                max_attempts: 3,
                interval: std::time::Duration::from_millis(1),
                stop_timeout: std::time::Duration::from_secs(1),
            },
        )
        .unwrap();
        Harness {
            _dir: dir,
            launcher,
            prober,
            controller: PhaseController::new(Arc::new(ctx)),
        }
    }

    #[tokio::test]
    async fn test_prepare_from_uninitialized() {
        let h = harness(vec![service("monolith", 0, &[MigrationPhase::Prepared])]);
        let report = h
            .controller
            .prepare(TransitionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.to, MigrationPhase::Prepared);
        assert_eq!(report.started, vec!["monolith"]);
        assert_eq!(h.controller.status().phase, Some(MigrationPhase::Prepared));
    }

    #[tokio::test]
    async fn test_skip_is_rejected_without_side_effects() {
        let h = harness(vec![service("auth", 0, &[MigrationPhase::Phase1])]);
        let err = h
            .controller
            .transition(
                MigrationPhase::Phase2,
                TransitionOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(h.launcher.total_spawns(), 0);
        assert_eq!(h.controller.status().phase, Some(MigrationPhase::Uninitialized));
    }

    #[tokio::test]
    async fn test_status_lists_required_services_not_started() {
        let h = harness(vec![service("auth", 0, &[MigrationPhase::Prepared])]);
        h.prober.always("http://auth/health", 503);

        let _ = h
            .controller
            .prepare(TransitionOptions::default(), &CancellationToken::new())
            .await;
        let report = h.controller.status();
        assert_eq!(report.phase, Some(MigrationPhase::Uninitialized));
        let auth = report.services.iter().find(|s| s.name == "auth").unwrap();
        assert_eq!(auth.health, HealthStatus::TimedOut);
        assert!(report.last_error.unwrap().contains("auth"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(vec![service("auth", 0, &[MigrationPhase::Prepared])]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .controller
            .prepare(TransitionOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(h.launcher.total_spawns(), 0);
    }
}
