//! Command handlers
//!
//! Each handler builds what it needs from [`OrchestratorConfig`], runs one
//! controller operation and returns the process exit code. Errors are printed
//! with their help text to stderr followed by the status report on stdout,
//! which falls back to the recorded phase when no context could be built.

use super::commands::{CliArgs, Commands, FormatArgs, PruneArgs, RollbackArgs, TransitionArgs};
use super::output::{OutputFormat, OutputFormatter};
use crate::catalog::Catalog;
use crate::config::OrchestratorConfig;
use crate::context::RolloutContext;
use crate::controller::{PhaseController, PhaseReport, TransitionOptions};
use crate::error::{OrchestratorError, EXIT_SUCCESS};
use crate::progress::LoggingHandler;
use crate::rollback::RollbackController;
use crate::state::{MigrationPhase, StateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub async fn run(args: &CliArgs) -> i32 {
    let config = OrchestratorConfig::default().with_overrides(
        args.deployment.clone(),
        args.catalog.clone(),
        args.state_dir.clone(),
    );
    if let Err(e) = config.validate() {
        return fail(&OrchestratorError::from(e));
    }
    debug!("{}", config);

    match &args.command {
        Commands::Prepare(t) => handle_transition(&config, MigrationPhase::Prepared, t).await,
        Commands::Phase1(t) => handle_transition(&config, MigrationPhase::Phase1, t).await,
        Commands::Phase2(t) => handle_transition(&config, MigrationPhase::Phase2, t).await,
        Commands::Phase3(t) => handle_transition(&config, MigrationPhase::Phase3, t).await,
        Commands::Rollback(r) => handle_rollback(&config, r).await,
        Commands::Status(f) => handle_status(&config, f),
        Commands::Checklist(f) => handle_checklist(&config, f),
        Commands::Config(f) => print(OutputFormatter::new(f.format.into()).format_config(&config)),
        Commands::Prune(p) => handle_prune(&config, p).await,
        Commands::Reset => handle_reset(&config).await,
    }
}

fn build_context(config: &OrchestratorConfig, catalog: Catalog) -> Result<Arc<RolloutContext>, OrchestratorError> {
    let context = RolloutContext::from_config(config, catalog)?.with_progress(Arc::new(LoggingHandler));
    Ok(Arc::new(context))
}

fn load_context(config: &OrchestratorConfig) -> Result<Arc<RolloutContext>, OrchestratorError> {
    let catalog = Catalog::load(&config.catalog_path)?;
    build_context(config, catalog)
}

/// Cancels the returned token on the first Ctrl-C. Calls already issued run
/// to completion; nothing new is started.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight calls and stopping");
            child.cancel();
        }
    });
    token
}

fn fail(error: &OrchestratorError) -> i32 {
    eprintln!("{}", error.help_message());
    error.exit_code()
}

fn print(rendered: anyhow::Result<String>) -> i32 {
    match rendered {
        Ok(text) => {
            println!("{}", text);
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            crate::error::EXIT_PREREQUISITE
        }
    }
}

/// Error text, then the report so the operator sees where things stand
fn fail_with_status(error: &OrchestratorError, report: &PhaseReport, format: OutputFormat) -> i32 {
    let code = fail(error);
    if let Ok(text) = OutputFormatter::new(format).format_status(report) {
        println!("{}", text);
    }
    code
}

async fn handle_transition(
    config: &OrchestratorConfig,
    target: MigrationPhase,
    args: &TransitionArgs,
) -> i32 {
    let format: OutputFormat = args.format.into();
    let ctx = match load_context(config) {
        Ok(ctx) => ctx,
        Err(e) => return fail_with_status(&e, &recorded_status(config, &Catalog::default()), format),
    };
    let controller = PhaseController::new(ctx);
    let options = TransitionOptions {
        force: args.force,
        skip_backup: args.no_backup,
    };

    match controller.transition(target, options, &cancel_on_ctrl_c()).await {
        Ok(report) => print(OutputFormatter::new(format).format_transition(&report)),
        Err(e) => fail_with_status(&e, &controller.status(), format),
    }
}

async fn handle_rollback(config: &OrchestratorConfig, args: &RollbackArgs) -> i32 {
    let format: OutputFormat = args.format.into();
    let ctx = match load_context(config) {
        Ok(ctx) => ctx,
        Err(e) => return fail_with_status(&e, &recorded_status(config, &Catalog::default()), format),
    };
    let rollback = RollbackController::new(ctx.clone());

    match rollback.rollback(args.force, &cancel_on_ctrl_c()).await {
        Ok(report) => print(OutputFormatter::new(format).format_rollback(&report)),
        Err(e) => fail_with_status(&e, &PhaseController::new(ctx).status(), format),
    }
}

fn handle_status(config: &OrchestratorConfig, args: &FormatArgs) -> i32 {
    // Status works without a valid catalog; required-service info is then missing
    let catalog = Catalog::load(&config.catalog_path).unwrap_or_else(|e| {
        warn!(error = %e, "Catalog unavailable, showing recorded state only");
        Catalog::default()
    });

    let report = recorded_status(config, &catalog);
    print(OutputFormatter::new(args.format.into()).format_status(&report))
}

/// Report built from the phase record alone, without a running context. An
/// unreadable record yields a report with an unknown phase and the reason.
fn recorded_status(config: &OrchestratorConfig, catalog: &Catalog) -> PhaseReport {
    match StateStore::new(&config.state_dir).load_or_new(&config.deployment) {
        Ok(state) => PhaseReport::from_state(&state, catalog),
        Err(e) => {
            warn!(deployment = %config.deployment, error = %e, "Phase record unreadable");
            PhaseReport::unreadable(&config.deployment, &e.to_string())
        }
    }
}

fn handle_checklist(config: &OrchestratorConfig, args: &FormatArgs) -> i32 {
    let ctx = match load_context(config) {
        Ok(ctx) => ctx,
        Err(e) => return fail(&e),
    };
    let controller = PhaseController::new(ctx);
    print(OutputFormatter::new(args.format.into()).format_checklist(&controller.checklist()))
}

async fn handle_prune(config: &OrchestratorConfig, args: &PruneArgs) -> i32 {
    let ctx = match build_context(config, Catalog::default()) {
        Ok(ctx) => ctx,
        Err(e) => return fail(&e),
    };
    match PhaseController::new(ctx).prune_backups(args.keep).await {
        Ok(removed) if removed.is_empty() => {
            println!("Nothing to prune");
            EXIT_SUCCESS
        }
        Ok(removed) => {
            println!("Removed {} backup(s): {}", removed.len(), removed.join(", "));
            EXIT_SUCCESS
        }
        Err(e) => fail(&e),
    }
}

async fn handle_reset(config: &OrchestratorConfig) -> i32 {
    let ctx = match build_context(config, Catalog::default()) {
        Ok(ctx) => ctx,
        Err(e) => return fail(&e),
    };
    match PhaseController::new(ctx).reset().await {
        Ok(true) => {
            println!("Deployment '{}' reset to uninitialized", config.deployment);
            EXIT_SUCCESS
        }
        Ok(false) => {
            println!("Deployment '{}' has no phase record", config.deployment);
            EXIT_SUCCESS
        }
        Err(e) => fail(&e),
    }
}
