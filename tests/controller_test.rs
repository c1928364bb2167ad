//! Phase controller scenarios against the in-crate test doubles

mod support;

use rollout::backup::BackupError;
use rollout::launcher::Launcher;
use rollout::routing::RouteTarget;
use rollout::{Catalog, HealthStatus, MigrationPhase, OrchestratorError, PhaseController, TransitionOptions};
use rollout::progress::ProgressEvent;
use rollout::RolloutSettings;
use std::sync::Arc;
use std::time::Duration;
use support::{health_url, lab_catalog, service, CancelOn, Harness};
use tokio_util::sync::CancellationToken;

fn no_backup() -> TransitionOptions {
    TransitionOptions {
        skip_backup: true,
        ..Default::default()
    }
}

async fn advance(harness: &Harness, target: MigrationPhase) {
    harness
        .controller()
        .transition(target, TransitionOptions::default(), &CancellationToken::new())
        .await
        .unwrap_or_else(|e| panic!("transition to {} failed: {}", target, e));
}

#[tokio::test]
async fn test_successful_transitions_follow_the_sequence() {
    let harness = Harness::new(lab_catalog());
    let mut seen = Vec::new();

    for phase in MigrationPhase::ROLLOUT_SEQUENCE {
        advance(&harness, phase).await;
        seen.push(harness.phase());
    }

    assert_eq!(
        seen,
        vec![
            MigrationPhase::Prepared,
            MigrationPhase::Phase1,
            MigrationPhase::Phase2,
            MigrationPhase::Phase3
        ]
    );

    // Phase3 retires the monolith; everything else stays up
    let running = harness.launcher.running();
    assert!(!running.contains("monolith"));
    for name in ["postgres", "auth", "sample", "results", "gateway"] {
        assert!(running.contains(name), "{} should be running", name);
    }
    let status = harness.controller().status();
    assert!(status.drift.orphaned.is_empty() && status.drift.missing.is_empty());
    assert_eq!(status.routing.target("results"), Some(RouteTarget::Microservice));
}

#[tokio::test]
async fn test_skipping_a_phase_is_rejected_without_side_effects() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    let spawns = harness.launcher.total_spawns();
    let writes = harness.routing.writes();

    for target in [MigrationPhase::Phase2, MigrationPhase::Phase3, MigrationPhase::Prepared] {
        let err = harness
            .controller()
            .transition(target, TransitionOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    assert_eq!(harness.phase(), MigrationPhase::Prepared);
    assert_eq!(harness.launcher.total_spawns(), spawns);
    assert_eq!(harness.routing.writes(), writes);
    assert!(harness.backup_tool.dumps().is_empty());
}

#[tokio::test]
async fn test_start_twice_returns_the_same_handle() {
    let harness = Harness::new(lab_catalog());
    let auth = harness.catalog.service("auth").unwrap();

    let first = harness.launcher.start(auth).await.unwrap();
    let second = harness.launcher.start(auth).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.launcher.spawn_count("auth"), 1);
}

#[tokio::test]
async fn test_partial_tier_names_only_the_failing_service() {
    use MigrationPhase::*;
    let catalog = Catalog::with_services(vec![
        service("a", 0, &[Prepared]),
        service("b", 0, &[Prepared]),
        service("c", 0, &[Prepared]),
        service("d", 1, &[Prepared]),
    ])
    .unwrap();
    let harness = Harness::new(catalog);
    harness.prober.always(&health_url("c"), 503);

    let err = harness
        .controller()
        .prepare(TransitionOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.failed_services(), vec!["c"]);
    assert_eq!(err.exit_code(), 2);

    // Healthy services stay up, the next tier is never started
    let running = harness.launcher.running();
    assert!(running.contains("a") && running.contains("b") && running.contains("c"));
    assert_eq!(harness.launcher.spawn_count("d"), 0);

    // Phase and routing untouched
    assert_eq!(harness.phase(), Uninitialized);
    assert_eq!(harness.routing.writes(), 0);

    let status = harness.controller().status();
    let health = |name: &str| {
        status
            .services
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.health)
            .unwrap()
    };
    assert_eq!(health("a"), HealthStatus::Healthy);
    assert_eq!(health("b"), HealthStatus::Healthy);
    assert_eq!(health("c"), HealthStatus::TimedOut);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_retry_after_partial_tier_only_starts_what_is_missing() {
    use MigrationPhase::*;
    let catalog = Catalog::with_services(vec![
        service("a", 0, &[Prepared]),
        service("b", 0, &[Prepared]),
    ])
    .unwrap();
    let harness = Harness::new(catalog);
    harness.prober.push_status(&health_url("b"), 503, 3);

    assert!(harness
        .controller()
        .prepare(TransitionOptions::default(), &CancellationToken::new())
        .await
        .is_err());
    harness.launcher.crash("b");

    // The scripted failures are used up; b answers 200 from now on
    advance(&harness, Prepared).await;
    assert_eq!(harness.launcher.spawn_count("a"), 1);
    assert_eq!(harness.launcher.spawn_count("b"), 2);
}

#[tokio::test]
async fn test_tiers_start_in_order_and_routes_flip() {
    use MigrationPhase::*;
    let catalog = Catalog::with_services(vec![
        service("auth", 0, &[Phase1]).serving("auth"),
        service("sample", 0, &[Phase1]).serving("sample"),
        service("gateway", 1, &[Phase1])
            .depends_on("auth")
            .depends_on("sample"),
    ])
    .unwrap();
    let harness = Harness::new(catalog);

    advance(&harness, Prepared).await;
    advance(&harness, Phase1).await;

    assert_eq!(harness.phase(), Phase1);
    let status = harness.controller().status();
    assert!(status
        .services
        .iter()
        .all(|s| s.health == HealthStatus::Healthy));
    assert_eq!(status.routing.target("auth"), Some(RouteTarget::Microservice));
    assert_eq!(status.routing.target("sample"), Some(RouteTarget::Microservice));
    assert!(status.routing.proxy_mode_enabled);
    assert_eq!(harness.routing.current(), Some(status.routing.clone()));

    // gateway launches only after both tier-0 gates passed
    let started = harness.events.started();
    assert_eq!(started.last().map(String::as_str), Some("gateway"));
    let gated = harness.events.gated();
    let gateway_gate = gated.iter().position(|s| s == "gateway").unwrap();
    assert_eq!(gateway_gate, 2);
}

#[tokio::test]
async fn test_launch_failure_fails_the_tier_but_not_its_siblings() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    harness.launcher.fail_start_of("sample");

    let err = harness
        .controller()
        .transition(MigrationPhase::Phase1, no_backup(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.failed_services(), vec!["sample"]);
    assert!(harness.launcher.running().contains("auth"));
    assert_eq!(harness.launcher.spawn_count("gateway"), 0);
    assert_eq!(harness.phase(), MigrationPhase::Prepared);
}

#[tokio::test]
async fn test_risky_phase_snapshots_first() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;

    let report = harness
        .controller()
        .transition(MigrationPhase::Phase1, TransitionOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.backup.is_some());
    assert_eq!(harness.backup_tool.dumps(), vec!["labdb"]);
    let state = harness.ctx.snapshot();
    assert_eq!(state.backups.len(), 1);
    assert_eq!(state.backups[0].phase_at_creation, MigrationPhase::Prepared);
    assert!(state.backups[0].is_complete());
}

#[tokio::test]
async fn test_partial_backup_blocks_risky_phase_unless_forced() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    harness.backup_tool.fail_dump_of("labdb");
    let spawns = harness.launcher.total_spawns();

    let err = harness
        .controller()
        .transition(MigrationPhase::Phase1, TransitionOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Backup(BackupError::Partial { .. })));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(harness.launcher.total_spawns(), spawns);
    assert_eq!(harness.phase(), MigrationPhase::Prepared);

    let forced = TransitionOptions {
        force: true,
        ..Default::default()
    };
    harness
        .controller()
        .transition(MigrationPhase::Phase1, forced, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(harness.phase(), MigrationPhase::Phase1);
    assert!(harness.ctx.snapshot().backups.iter().all(|b| b.partial));
}

#[tokio::test]
async fn test_no_backup_skips_the_snapshot() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;

    let report = harness
        .controller()
        .transition(MigrationPhase::Phase1, no_backup(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.backup.is_none());
    assert!(harness.backup_tool.dumps().is_empty());
}

#[tokio::test]
async fn test_routing_failure_keeps_the_phase() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    harness.routing.set_failing(true);

    let err = harness
        .controller()
        .transition(MigrationPhase::Phase1, no_backup(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 6);
    assert_eq!(harness.phase(), MigrationPhase::Prepared);
    assert!(!harness.ctx.snapshot().routing.proxy_mode_enabled);
    // New services were started and stay up for a retry
    assert!(harness.launcher.running().contains("gateway"));
    assert!(harness.launcher.stopped().is_empty());
}

#[tokio::test]
async fn test_crashed_service_is_restarted_on_next_transition() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    advance(&harness, MigrationPhase::Phase1).await;
    harness.launcher.crash("auth");

    advance(&harness, MigrationPhase::Phase2).await;

    assert_eq!(harness.launcher.spawn_count("auth"), 2);
    assert_eq!(harness.launcher.spawn_count("sample"), 1);
}

#[tokio::test]
async fn test_unstoppable_service_shows_up_as_drift() {
    let harness = Harness::new(lab_catalog());
    for phase in [MigrationPhase::Prepared, MigrationPhase::Phase1, MigrationPhase::Phase2] {
        advance(&harness, phase).await;
    }
    harness.launcher.fail_stop_of("monolith");

    advance(&harness, MigrationPhase::Phase3).await;

    let status = harness.controller().status();
    assert_eq!(status.phase, Some(MigrationPhase::Phase3));
    assert_eq!(status.drift.orphaned, vec!["monolith"]);
}

#[tokio::test]
async fn test_phase_record_survives_a_new_orchestrator() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    advance(&harness, MigrationPhase::Phase1).await;

    let reopened = PhaseController::new(harness.reopen());
    let status = reopened.status();
    assert_eq!(status.phase, Some(MigrationPhase::Phase1));
    assert!(status.services.iter().any(|s| s.name == "gateway" && s.handle.is_some()));

    // Continuing from the new instance reuses the running services
    let spawns = harness.launcher.spawn_count("auth");
    reopened
        .transition(MigrationPhase::Phase2, TransitionOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(harness.launcher.spawn_count("auth"), spawns);
}

#[tokio::test]
async fn test_launcher_unavailable_is_a_prerequisite_failure() {
    let harness = Harness::new(lab_catalog());
    harness.launcher.set_available(false);

    let err = harness
        .controller()
        .prepare(TransitionOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 1);
    assert_eq!(harness.launcher.total_spawns(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_issues_nothing() {
    let harness = Harness::new(lab_catalog());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .controller()
        .prepare(TransitionOptions::default(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 130);
    assert_eq!(harness.launcher.total_spawns(), 0);
    assert_eq!(harness.phase(), MigrationPhase::Uninitialized);
}

#[tokio::test]
async fn test_prune_keeps_newest_backups() {
    let harness = Harness::new(lab_catalog());
    for phase in MigrationPhase::ROLLOUT_SEQUENCE {
        advance(&harness, phase).await;
    }
    let before = harness.ctx.snapshot().backups;
    assert_eq!(before.len(), 2);

    let removed = harness.controller().prune_backups(1).await.unwrap();
    assert_eq!(removed.len(), 1);

    let after = harness.ctx.snapshot().backups;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].phase_at_creation, MigrationPhase::Phase2);
    assert!(!before
        .iter()
        .find(|b| b.id == removed[0])
        .unwrap()
        .storage_location
        .exists());
}

#[tokio::test]
async fn test_reset_only_from_baseline() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;

    let err = harness.controller().reset().await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert_eq!(harness.phase(), MigrationPhase::Prepared);

    harness
        .rollback()
        .rollback(false, &CancellationToken::new())
        .await
        .unwrap();
    assert!(harness.controller().reset().await.unwrap());
    assert_eq!(harness.phase(), MigrationPhase::Uninitialized);
}

#[tokio::test]
async fn test_reset_keeps_backups_reachable_for_prune() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    advance(&harness, MigrationPhase::Phase1).await;
    harness
        .rollback()
        .rollback(false, &CancellationToken::new())
        .await
        .unwrap();
    let storage = harness.ctx.snapshot().backups[0].storage_location.clone();

    assert!(harness.controller().reset().await.unwrap());

    let state = harness.ctx.snapshot();
    assert_eq!(state.phase, MigrationPhase::Uninitialized);
    assert!(state.rolled_back_from.is_none());
    assert!(state.routing.routes.is_empty());
    assert_eq!(state.backups.len(), 1);

    // A new orchestrator still sees the backup
    let reopened = PhaseController::new(harness.reopen());
    assert_eq!(reopened.status().backups, 1);

    let removed = reopened.prune_backups(0).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(!storage.exists());
}

#[tokio::test]
async fn test_cancel_mid_bring_up_keeps_started_tier() {
    let harness = Harness::new(lab_catalog());
    let interrupt = Arc::new(CancelOn::new(|event| {
        matches!(event, ProgressEvent::ServiceStarted { service, .. } if service == "postgres")
    }));
    let token = interrupt.token.clone();
    let controller = PhaseController::new(harness.reopen_with(support::FAST, interrupt));

    let err = controller
        .transition(MigrationPhase::Prepared, TransitionOptions::default(), &token)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    // Tier 0 is left up for the operator; tier 1 never starts
    assert_eq!(harness.launcher.spawn_count("postgres"), 1);
    assert!(harness.launcher.running().contains("postgres"));
    assert_eq!(harness.launcher.spawn_count("monolith"), 0);
    assert_eq!(controller.status().phase, Some(MigrationPhase::Uninitialized));
    assert_eq!(harness.routing.writes(), 0);
}

#[tokio::test]
async fn test_status_during_health_gate_shows_previous_phase() {
    let harness = Harness::new(lab_catalog());
    advance(&harness, MigrationPhase::Prepared).await;
    harness.prober.push_status(&health_url("auth"), 503, 5);

    let slow = RolloutSettings {
        max_attempts: 20,
        interval: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(1),
    };
    let ctx = harness.reopen_with(slow, harness.events.clone());
    let transition = tokio::spawn({
        let controller = PhaseController::new(ctx.clone());
        async move {
            controller
                .transition(MigrationPhase::Phase1, no_backup(), &CancellationToken::new())
                .await
        }
    });

    let observer = PhaseController::new(ctx);
    let mut seen_starting = false;
    for _ in 0..200 {
        let status = observer.status();
        let auth = status.services.iter().find(|s| s.name == "auth").map(|s| s.health);
        if auth == Some(HealthStatus::Starting) {
            assert_eq!(status.phase, Some(MigrationPhase::Prepared));
            assert!(!status.routing.proxy_mode_enabled);
            assert_eq!(status.routing.target("auth"), Some(RouteTarget::Legacy));
            seen_starting = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen_starting, "auth was never reported as starting");

    transition.await.unwrap().unwrap();
    let status = observer.status();
    assert_eq!(status.phase, Some(MigrationPhase::Phase1));
    assert!(status.routing.proxy_mode_enabled);
}
