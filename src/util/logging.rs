//! Structured logging setup
//!
//! Initializes a `tracing` subscriber once per process. Logs always go to
//! stderr so stdout carries nothing but reports, which keeps
//! `orchestrator status --format json | jq` usable.
//!
//! # Example
//!
//! ```no_run
//! use rollout::util::logging;
//!
//! logging::init_from_env();
//!
//! use tracing::{info, warn};
//!
//! info!(deployment = "lab", "Rollout started");
//! warn!(service = "auth", "Health check timed out");
//! ```

use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// The library and the `orchestrator` binary, whose events carry its own target
const OWN_TARGETS: &[&str] = &["rollout", "orchestrator"];

/// Dependencies that are chatty at `info` and below
const NOISY_DEPENDENCIES: &[&str] = &["h2", "hyper", "hyper_util", "reqwest", "bollard"];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level for this crate's own events
    pub level: Level,

    /// Use JSON output format (for log shippers)
    pub use_json: bool,

    /// Include the module target (e.g., rollout::controller) in logs
    pub include_target: bool,

    /// Include file and line number information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_target: false,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// JSON output with targets and source locations
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            use_json: true,
            include_target: true,
            include_location: true,
        }
    }
}

/// Parses a log level, falling back to `INFO` for unknown values
pub fn parse_level(level_str: &str) -> Level {
    match level_str.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        }
    }
}

fn directive(spec: &str) -> Option<Directive> {
    spec.parse().ok()
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();
    for target in OWN_TARGETS {
        if let Some(own) = directive(&format!("{}={}", target, config.level)) {
            filter = filter.add_directive(own);
        }
    }

    // RUST_LOG wins over our caps when it is set
    if env::var("RUST_LOG").is_err() {
        for dependency in NOISY_DEPENDENCIES {
            if let Some(cap) = directive(&format!("{}=warn", dependency)) {
                filter = filter.add_directive(cap);
            }
        }
    }
    filter
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(&config);

        if config.use_json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location),
                )
                .init();
        }
    });
}

/// Reads `ROLLOUT_LOG_LEVEL` and `ROLLOUT_LOG_JSON`
pub fn config_from_env() -> LoggingConfig {
    let level = env::var("ROLLOUT_LOG_LEVEL")
        .map(|v| parse_level(&v))
        .unwrap_or(Level::INFO);

    let use_json = env::var("ROLLOUT_LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);

    LoggingConfig {
        level,
        use_json,
        ..Default::default()
    }
}

pub fn init_from_env() {
    init_logging(config_from_env());
}
