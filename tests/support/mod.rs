//! Shared harness for controller and rollback tests
//!
//! Wires a [`RolloutContext`] to the in-crate test doubles and a temporary
//! state directory.

#![allow(dead_code)]

use rollout::backup::MockBackupTool;
use rollout::catalog::{CatalogFile, PhasePlan};
use rollout::health::ScriptedProber;
use rollout::launcher::MockLauncher;
use rollout::progress::{ProgressEvent, ProgressHandler};
use rollout::routing::MemoryRoutingStore;
use rollout::{
    Catalog, HealthCheck, MigrationPhase, PhaseController, ResourceSpec, RollbackController,
    RolloutContext, RolloutSettings, ServiceSpec,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const ALL_ROLLOUT_PHASES: [MigrationPhase; 4] = MigrationPhase::ROLLOUT_SEQUENCE;

pub const FAST: RolloutSettings = RolloutSettings {
    max_attempts: 3,
    interval: Duration::from_millis(1),
    stop_timeout: Duration::from_secs(1),
};

pub fn health_url(service: &str) -> String {
    format!("http://{}.test/health", service)
}

pub fn service(name: &str, tier: u32, phases: &[MigrationPhase]) -> ServiceSpec {
    ServiceSpec::new(name, tier, format!("lab/{}:latest", name))
        .with_health(HealthCheck::http(health_url(name)))
        .in_phases(phases.iter().copied())
}

/// Monolith retired in phase3, new services added in phase1 and phase2,
/// labdb snapshotted before phase1 and phase3.
pub fn lab_catalog() -> Catalog {
    use MigrationPhase::*;

    let services = vec![
        service("postgres", 0, &ALL_ROLLOUT_PHASES),
        service("monolith", 1, &[Prepared, Phase1, Phase2]).depends_on("postgres"),
        service("auth", 1, &[Phase1, Phase2, Phase3])
            .depends_on("postgres")
            .serving("auth"),
        service("sample", 1, &[Phase1, Phase2, Phase3])
            .depends_on("postgres")
            .serving("sample"),
        service("results", 1, &[Phase2, Phase3])
            .depends_on("postgres")
            .serving("results"),
        service("gateway", 2, &[Phase1, Phase2, Phase3])
            .depends_on("auth")
            .depends_on("sample"),
    ];

    let mut phases = BTreeMap::new();
    for phase in [Phase1, Phase3] {
        phases.insert(
            phase,
            PhasePlan {
                risky: true,
                backup: vec!["labdb".to_string()],
                ..Default::default()
            },
        );
    }

    Catalog::from_file(CatalogFile {
        routes: vec!["auth".to_string(), "sample".to_string(), "results".to_string()],
        resources: vec![ResourceSpec::command(
            "labdb",
            "pg_dump lab > {dest}",
            "psql lab < {src}",
        )],
        phases,
        services,
    })
    .unwrap()
}

/// Records every progress event in order
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Service names in the order the launcher returned their handles
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::ServiceStarted { service, .. } => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Services in the order their health gate finished
    pub fn gated(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::ServiceHealth { service, .. } => Some(service),
                _ => None,
            })
            .collect()
    }
}

impl ProgressHandler for RecordingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Cancels a token at the first event `trigger` matches, acting like an
/// operator pressing Ctrl-C at that point
pub struct CancelOn {
    pub token: CancellationToken,
    trigger: fn(&ProgressEvent) -> bool,
}

impl CancelOn {
    pub fn new(trigger: fn(&ProgressEvent) -> bool) -> Self {
        Self {
            token: CancellationToken::new(),
            trigger,
        }
    }
}

impl ProgressHandler for CancelOn {
    fn on_progress(&self, event: &ProgressEvent) {
        if (self.trigger)(event) {
            self.token.cancel();
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub catalog: Arc<Catalog>,
    pub launcher: Arc<MockLauncher>,
    pub prober: Arc<ScriptedProber>,
    pub backup_tool: Arc<MockBackupTool>,
    pub routing: Arc<MemoryRoutingStore>,
    pub events: Arc<RecordingHandler>,
    pub ctx: Arc<RolloutContext>,
}

impl Harness {
    pub fn new(catalog: Catalog) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(catalog);
        let launcher = Arc::new(MockLauncher::new());
        let prober = Arc::new(ScriptedProber::new());
        let backup_tool = Arc::new(MockBackupTool::new());
        let routing = Arc::new(MemoryRoutingStore::new());
        let events = Arc::new(RecordingHandler::default());

        let ctx = Self::context(
            &dir,
            &catalog,
            &launcher,
            &prober,
            &backup_tool,
            &routing,
            events.clone(),
            FAST,
        );

        Self {
            dir,
            catalog,
            launcher,
            prober,
            backup_tool,
            routing,
            events,
            ctx,
        }
    }

    fn context(
        dir: &TempDir,
        catalog: &Arc<Catalog>,
        launcher: &Arc<MockLauncher>,
        prober: &Arc<ScriptedProber>,
        backup_tool: &Arc<MockBackupTool>,
        routing: &Arc<MemoryRoutingStore>,
        progress: Arc<dyn ProgressHandler>,
        settings: RolloutSettings,
    ) -> Arc<RolloutContext> {
        let ctx = RolloutContext::new(
            "lab",
            catalog.clone(),
            launcher.clone(),
            prober.clone(),
            backup_tool.clone(),
            dir.path().join("backups"),
            routing.clone(),
            dir.path().join("state"),
            settings,
        )
        .unwrap()
        .with_progress(progress);
        Arc::new(ctx)
    }

    /// A second orchestrator over the same state directory and backends
    pub fn reopen(&self) -> Arc<RolloutContext> {
        self.reopen_with(FAST, self.events.clone())
    }

    /// Like [`Harness::reopen`] with other gate settings and progress handler
    pub fn reopen_with(
        &self,
        settings: RolloutSettings,
        progress: Arc<dyn ProgressHandler>,
    ) -> Arc<RolloutContext> {
        Self::context(
            &self.dir,
            &self.catalog,
            &self.launcher,
            &self.prober,
            &self.backup_tool,
            &self.routing,
            progress,
            settings,
        )
    }

    pub fn controller(&self) -> PhaseController {
        PhaseController::new(self.ctx.clone())
    }

    pub fn rollback(&self) -> RollbackController {
        RollbackController::new(self.ctx.clone())
    }

    pub fn phase(&self) -> MigrationPhase {
        self.ctx.snapshot().phase
    }
}
