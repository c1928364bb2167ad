//! rollout - phased migration and rollout orchestrator
//!
//! Moves a deployment from a legacy monolith to microservices through a fixed
//! sequence of phases. Each transition starts the services a phase needs in
//! dependency tiers, gates every tier on health checks, flips the gateway's
//! routing table and only then stops what is no longer needed. A rollback
//! returns the deployment to its legacy baseline and restores the backup
//! taken before the risky phase.
//!
//! # Core Concepts
//!
//! - **Catalog**: every service with its tier, health check, start reference
//!   and the phases that require it
//! - **Phase record**: the persisted current phase, per-service handles and
//!   health, routing table and backups of one deployment
//! - **Collaborators**: [`launcher::Launcher`], [`health::Prober`],
//!   [`backup::BackupTool`] and [`routing::RoutingStore`] traits with real
//!   implementations and in-crate test doubles
//!
//! # Example Usage
//!
//! ```ignore
//! use rollout::{Catalog, OrchestratorConfig, PhaseController, RolloutContext, TransitionOptions};
//! use rollout::state::MigrationPhase;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn advance(config: &OrchestratorConfig) -> Result<(), rollout::OrchestratorError> {
//!     let catalog = Catalog::load(&config.catalog_path)?;
//!     let ctx = Arc::new(RolloutContext::from_config(config, catalog)?);
//!     let controller = PhaseController::new(ctx);
//!
//!     let report = controller
//!         .transition(MigrationPhase::Phase1, TransitionOptions::default(), &CancellationToken::new())
//!         .await?;
//!     println!("started: {:?}", report.started);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod health;
pub mod launcher;
pub mod progress;
pub mod rollback;
pub mod routing;
pub mod state;
pub mod util;

pub use backup::{BackupManager, BackupRecord, RestoreSummary};
pub use catalog::{Catalog, CatalogError, HealthCheck, ResourceSpec, ServiceSpec};
pub use config::{ConfigError, OrchestratorConfig};
pub use context::{RolloutContext, RolloutSettings};
pub use controller::{PhaseController, PhaseReport, TransitionOptions, TransitionReport};
pub use error::OrchestratorError;
pub use health::{HealthGate, HealthStatus};
pub use rollback::{Checklist, RollbackController, RollbackReport};
pub use routing::{RouteTarget, RoutingConfig, TrafficRouter};
pub use state::{MigrationPhase, PhaseState, StateStore};
pub use util::{init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
