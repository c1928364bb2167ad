//! Operator rollback checklist, derived from the same catalog and phase record
//! the rollback controller acts on.

use crate::backup::latest_restorable;
use crate::catalog::Catalog;
use crate::routing::{env_flag_name, RouteTarget};
use crate::state::{MigrationPhase, PhaseState};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistStep {
    pub title: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

impl ChecklistStep {
    fn new(title: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            title: title.into(),
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checklist {
    pub deployment: String,
    pub phase: MigrationPhase,
    pub steps: Vec<ChecklistStep>,
}

impl Checklist {
    pub fn generate(catalog: &Catalog, state: &PhaseState) -> Self {
        let from = match state.phase {
            MigrationPhase::RolledBack => state.rolled_back_from.unwrap_or(MigrationPhase::Prepared),
            other => other,
        };
        let baseline = catalog.services_for_phase(MigrationPhase::Prepared);
        let mut steps = Vec::new();

        if !state.phase.can_roll_back() {
            steps.push(ChecklistStep::new(
                "Nothing to roll back: the deployment has not been prepared",
                Vec::new(),
            ));
            return Self {
                deployment: state.deployment.clone(),
                phase: state.phase,
                steps,
            };
        }

        let missing: Vec<String> = baseline
            .iter()
            .filter(|s| state.handle(&s.name).is_none())
            .map(|s| format!("{} (tier {}, start: {})", s.name, s.tier, s.start_ref))
            .collect();
        if !missing.is_empty() {
            steps.push(ChecklistStep::new(
                "Start the legacy baseline before moving traffic",
                missing,
            ));
        }

        let migrated: Vec<String> = state
            .routing
            .routes
            .iter()
            .filter(|(_, target)| **target == RouteTarget::Microservice)
            .map(|(route, _)| format!("{}: microservice -> legacy ({}=false)", route, env_flag_name(route)))
            .collect();
        let mut routing_items = migrated;
        if state.routing.proxy_mode_enabled {
            routing_items.push("ENABLE_PROXY_MODE=false".to_string());
        }
        steps.push(ChecklistStep::new(
            "Switch all routes back to legacy and reload the gateway",
            routing_items,
        ));

        let baseline_names = catalog.required_names(MigrationPhase::Prepared);
        let mut to_stop: Vec<(u32, String)> = state
            .services
            .iter()
            .filter(|(name, s)| s.handle.is_some() && !baseline_names.contains(*name))
            .map(|(name, s)| (s.tier, name.clone()))
            .collect();
        to_stop.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        if !to_stop.is_empty() {
            steps.push(ChecklistStep::new(
                "Stop services the legacy baseline does not use (highest tier first)",
                to_stop
                    .into_iter()
                    .map(|(tier, name)| format!("{} (tier {})", name, tier))
                    .collect(),
            ));
        }

        let record = match state.phase {
            MigrationPhase::RolledBack => state
                .pending_restore
                .as_ref()
                .and_then(|id| state.backups.iter().find(|b| &b.id == id)),
            _ => latest_restorable(&state.backups, from),
        };
        match record {
            Some(record) => steps.push(ChecklistStep::new(
                format!("Restore backup {}", record.id),
                record
                    .resources_included
                    .iter()
                    .map(|name| {
                        let file = record
                            .artifacts
                            .get(name)
                            .map(|a| record.storage_location.join(&a.file).display().to_string())
                            .unwrap_or_else(|| record.storage_location.display().to_string());
                        format!("{} from {}", name, file)
                    })
                    .collect(),
            )),
            None if state.phase != MigrationPhase::RolledBack => steps.push(ChecklistStep::new(
                format!("No complete backup taken at or before {}; data stays as is", from),
                Vec::new(),
            )),
            None => {}
        }

        steps.push(ChecklistStep::new(
            "Verify the legacy baseline is healthy",
            baseline
                .iter()
                .map(|s| format!("{}: {}", s.name, s.health_check.url))
                .collect(),
        ));

        if state.phase != MigrationPhase::RolledBack {
            steps.push(ChecklistStep::new(
                "Record the rollback: orchestrator rollback",
                Vec::new(),
            ));
        }

        Self {
            deployment: state.deployment.clone(),
            phase: state.phase,
            steps,
        }
    }
}
