use crate::state::MigrationPhase;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Phased migration orchestrator
#[derive(Parser, Debug)]
#[command(
    name = "orchestrator",
    about = "Phased migration orchestrator: tiered startup, health gates, traffic flips and rollback",
    version,
    author,
    long_about = "orchestrator moves a deployment from its legacy monolith to microservices \
                  one phase at a time. Each phase starts the services it needs tier by tier, \
                  waits for them to become healthy, then switches the gateway's routing. \
                  `rollback` returns to the legacy baseline from any phase."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        value_name = "NAME",
        help = "Deployment name (overrides ROLLOUT_DEPLOYMENT)"
    )]
    pub deployment: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Service catalog (overrides ROLLOUT_CATALOG)"
    )]
    pub catalog: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Directory holding phase records (overrides ROLLOUT_STATE_DIR)"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - only errors are logged"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Start the legacy baseline and create the phase record",
        long_about = "Brings up the services of the `prepared` phase (usually the monolith and \
                      its infrastructure). Allowed from a fresh deployment or after a rollback.\n\n\
                      Examples:\n  \
                      orchestrator prepare\n  \
                      orchestrator --deployment staging prepare --format json"
    )]
    Prepare(TransitionArgs),

    #[command(about = "Advance from prepared to phase1")]
    Phase1(TransitionArgs),

    #[command(about = "Advance from phase1 to phase2")]
    Phase2(TransitionArgs),

    #[command(about = "Advance from phase2 to phase3")]
    Phase3(TransitionArgs),

    #[command(
        about = "Return to the legacy baseline",
        long_about = "Flips every route back to legacy, stops services the baseline does not \
                      use and restores the newest complete backup taken at or before the current \
                      phase.\n\n\
                      Examples:\n  \
                      orchestrator rollback\n  \
                      orchestrator rollback --force"
    )]
    Rollback(RollbackArgs),

    #[command(about = "Show the current phase, service health and routing")]
    Status(FormatArgs),

    #[command(about = "Print the operator rollback checklist for the current state")]
    Checklist(FormatArgs),

    #[command(about = "Show the effective configuration")]
    Config(FormatArgs),

    #[command(about = "Delete old backups, keeping the newest ones")]
    Prune(PruneArgs),

    #[command(
        about = "Delete the phase record",
        long_about = "Deletes the phase record so the deployment starts over as uninitialized. \
                      Refused unless the deployment is uninitialized or rolled back."
    )]
    Reset,
}

impl Commands {
    /// Phase a transition command targets
    pub fn target_phase(&self) -> Option<MigrationPhase> {
        match self {
            Commands::Prepare(_) => Some(MigrationPhase::Prepared),
            Commands::Phase1(_) => Some(MigrationPhase::Phase1),
            Commands::Phase2(_) => Some(MigrationPhase::Phase2),
            Commands::Phase3(_) => Some(MigrationPhase::Phase3),
            _ => None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct TransitionArgs {
    #[arg(long, help = "Proceed even if the pre-transition backup fails or is partial")]
    pub force: bool,

    #[arg(long, help = "Skip the pre-transition backup")]
    pub no_backup: bool,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct RollbackArgs {
    #[arg(long, help = "Continue when services refuse to stop")]
    pub force: bool,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct FormatArgs {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    #[arg(long, value_name = "N", default_value = "3", help = "Number of backups to keep")]
    pub keep: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}
