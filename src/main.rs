use rollout::cli::commands::CliArgs;
use rollout::cli::handlers;
use rollout::util::logging::{self, parse_level};
use rollout::VERSION;

use clap::Parser;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("orchestrator v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = handlers::run(&args).await;
    std::process::exit(exit_code);
}

/// `--log-level` wins over `-v`/`-q`, which win over `ROLLOUT_LOG_LEVEL`
fn init_logging_from_args(args: &CliArgs) {
    let mut config = logging::config_from_env();
    if let Some(level) = &args.log_level {
        config.level = parse_level(level);
    } else if args.verbose {
        config.level = Level::DEBUG;
    } else if args.quiet {
        config.level = Level::ERROR;
    }
    logging::init_logging(config);
}
