//! Output formatting for JSON, YAML and human-readable text
//!
//! Reports go to stdout; logs go to stderr. Machine formats serialize the
//! report structs as they are, the human format is a compact tree view.
//!
//! # Example
//!
//! ```ignore
//! use rollout::cli::output::{OutputFormat, OutputFormatter};
//!
//! let formatter = OutputFormatter::new(OutputFormat::Json);
//! println!("{}", formatter.format_status(&controller.status())?);
//! ```

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::controller::{PhaseReport, TransitionReport};
use crate::health::HealthStatus;
use crate::rollback::{Checklist, RollbackReport};
use crate::routing::{RouteTarget, RoutingConfig};
use crate::state::Drift;

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format_status(&self, report: &PhaseReport) -> Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.status_human(report)),
            _ => self.serialize(report, "status report"),
        }
    }

    pub fn format_transition(&self, report: &TransitionReport) -> Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.transition_human(report)),
            _ => self.serialize(report, "transition report"),
        }
    }

    pub fn format_rollback(&self, report: &RollbackReport) -> Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.rollback_human(report)),
            _ => self.serialize(report, "rollback report"),
        }
    }

    pub fn format_checklist(&self, checklist: &Checklist) -> Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.checklist_human(checklist)),
            _ => self.serialize(checklist, "checklist"),
        }
    }

    pub fn format_config(&self, config: &OrchestratorConfig) -> Result<String> {
        match self.format {
            OutputFormat::Human => Ok(format!("{}", config)),
            _ => {
                let map: std::collections::BTreeMap<_, _> =
                    config.to_display_map().into_iter().collect();
                self.serialize(&map, "configuration")
            }
        }
    }

    fn serialize<T: Serialize>(&self, value: &T, what: &str) -> Result<String> {
        match self.format {
            OutputFormat::Yaml => serde_yaml::to_string(value)
                .with_context(|| format!("Failed to serialize {} to YAML", what)),
            _ => serde_json::to_string_pretty(value)
                .with_context(|| format!("Failed to serialize {} to JSON", what)),
        }
    }

    fn status_human(&self, report: &PhaseReport) -> String {
        let mut output = String::new();

        output.push_str(&format!("Deployment {}\n", report.deployment));
        output.push_str(RULE);
        output.push_str("\n\n");

        match report.phase {
            Some(phase) => output.push_str(&format!("Phase:       {}", phase)),
            None => output.push_str("Phase:       unknown"),
        }
        if let Some(from) = report.rolled_back_from {
            output.push_str(&format!(" (from {})", from));
        }
        output.push('\n');
        match (report.phase, report.next_phase) {
            (_, Some(next)) => output.push_str(&format!("Next:        {}\n", next)),
            (Some(_), None) => output.push_str("Next:        (final phase)\n"),
            (None, None) => {}
        }
        output.push_str(&format!(
            "Updated:     {}\n\n",
            report.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        output.push_str("Services:\n");
        if report.services.is_empty() {
            output.push_str("\u{2514}\u{2500} (none)\n");
        }
        for (i, service) in report.services.iter().enumerate() {
            let connector = tree_connector(i, report.services.len());
            let required = if service.required { "" } else { " [not required]" };
            let handle = service
                .handle
                .as_deref()
                .map(|h| format!(" ({})", h))
                .unwrap_or_default();
            output.push_str(&format!(
                "{}\u{2500} {} {:<24} tier {}  {}{}{}\n",
                connector,
                health_symbol(service.health),
                service.name,
                service.tier,
                service.health,
                handle,
                required
            ));
        }
        output.push('\n');

        push_routing(&mut output, &report.routing);
        push_drift(&mut output, &report.drift);

        output.push_str(&format!("\nBackups: {}", report.backups));
        if let Some(latest) = &report.latest_backup {
            output.push_str(&format!(" (latest {})", latest));
        }
        output.push('\n');

        if let Some(pending) = &report.pending_restore {
            output.push_str(&format!(
                "\n\u{26A0} Restore of backup {} is pending; rerun `orchestrator rollback`\n",
                pending
            ));
        }
        if let Some(error) = &report.last_error {
            output.push_str(&format!("\n\u{26A0} Last error: {}\n", error));
        }

        output
    }

    fn transition_human(&self, report: &TransitionReport) -> String {
        let mut output = String::new();

        output.push_str(&format!("\u{2713} {} -> {}\n", report.from, report.to));
        output.push_str(RULE);
        output.push_str("\n\n");

        push_list(&mut output, "Started", &report.started);
        push_list(&mut output, "Stopped", &report.stopped);
        if let Some(backup) = &report.backup {
            output.push_str(&format!("Backup:  {}\n", backup));
        }
        output.push('\n');

        push_routing(&mut output, &report.routing);
        push_drift(&mut output, &report.drift);

        output.push_str(&format!("\nCompleted in {}ms\n", report.duration_ms));
        output
    }

    fn rollback_human(&self, report: &RollbackReport) -> String {
        let mut output = String::new();

        output.push_str(&format!("\u{2713} Rolled back from {}\n", report.from));
        output.push_str(RULE);
        output.push_str("\n\n");

        push_list(&mut output, "Restarted", &report.restarted);
        push_list(&mut output, "Stopped", &report.stopped);
        if !report.stop_failures.is_empty() {
            push_list(&mut output, "\u{26A0} Still running", &report.stop_failures);
        }
        match &report.restore {
            Some(summary) => {
                output.push_str(&format!("Restored backup {}\n", summary.backup_id));
                push_list(&mut output, "  Resources", &summary.restored);
                if !summary.skipped.is_empty() {
                    push_list(&mut output, "  Skipped", &summary.skipped);
                }
            }
            None => output.push_str("Restore: (no backup restored)\n"),
        }
        output.push('\n');

        push_routing(&mut output, &report.routing);
        push_drift(&mut output, &report.drift);

        output.push_str(&format!("\nCompleted in {}ms\n", report.duration_ms));
        output
    }

    fn checklist_human(&self, checklist: &Checklist) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "Rollback checklist for {} ({})\n",
            checklist.deployment, checklist.phase
        ));
        output.push_str(RULE);
        output.push_str("\n\n");

        for (i, step) in checklist.steps.iter().enumerate() {
            output.push_str(&format!("[ ] {}. {}\n", i + 1, step.title));
            for item in &step.items {
                output.push_str(&format!("      - {}\n", item));
            }
        }
        output
    }
}

fn tree_connector(index: usize, len: usize) -> &'static str {
    if index + 1 == len {
        "\u{2514}"
    } else {
        "\u{251C}"
    }
}

fn health_symbol(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "\u{2713}",
        HealthStatus::Unhealthy | HealthStatus::TimedOut => "\u{2717}",
        HealthStatus::Unknown | HealthStatus::Starting => "\u{2026}",
    }
}

fn push_list(output: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        output.push_str(&format!("{}: (none)\n", label));
    } else {
        output.push_str(&format!("{}: {}\n", label, items.join(", ")));
    }
}

fn push_routing(output: &mut String, routing: &RoutingConfig) {
    output.push_str(&format!(
        "Routing (proxy mode {}):\n",
        if routing.proxy_mode_enabled { "on" } else { "off" }
    ));
    if routing.routes.is_empty() {
        output.push_str("\u{2514}\u{2500} (no routes)\n");
    }
    for (i, (route, target)) in routing.routes.iter().enumerate() {
        let arrow = match target {
            RouteTarget::Legacy => "legacy",
            RouteTarget::Microservice => "microservice",
        };
        output.push_str(&format!(
            "{}\u{2500} {:<24} -> {}\n",
            tree_connector(i, routing.routes.len()),
            route,
            arrow
        ));
    }
}

fn push_drift(output: &mut String, drift: &Drift) {
    if drift.is_empty() {
        return;
    }
    output.push_str("\n\u{26A0} Drift:\n");
    if !drift.orphaned.is_empty() {
        output.push_str(&format!("  Running but not required: {}\n", drift.orphaned.join(", ")));
    }
    if !drift.missing.is_empty() {
        output.push_str(&format!("  Required but not running: {}\n", drift.missing.join(", ")));
    }
}
