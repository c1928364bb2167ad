//! Traffic routing between the legacy implementation and the new services
//!
//! A [`RoutingConfig`] replaces the scattered feature flags the gateway used
//! to read (`ENABLE_PROXY_MODE`, `USE_AUTH_SERVICE`, ...). The table for a
//! phase is derived from the catalog: a route moves to `microservice` when a
//! service required in that phase declares it.

pub mod store;

pub use store::{
    env_flag_name, render_env, FileRoutingStore, MemoryRoutingStore, RoutingFormat, RoutingStore,
};

use crate::catalog::Catalog;
use crate::state::MigrationPhase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTarget {
    Legacy,
    Microservice,
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Legacy => write!(f, "legacy"),
            RouteTarget::Microservice => write!(f, "microservice"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub routes: BTreeMap<String, RouteTarget>,
    pub proxy_mode_enabled: bool,
}

impl RoutingConfig {
    /// `proxy_mode_enabled` follows the table: on when any route is migrated
    pub fn from_routes(routes: BTreeMap<String, RouteTarget>) -> Self {
        let proxy_mode_enabled = routes.values().any(|t| *t == RouteTarget::Microservice);
        Self {
            routes,
            proxy_mode_enabled,
        }
    }

    pub fn for_phase(catalog: &Catalog, phase: MigrationPhase) -> Self {
        let migrated: BTreeSet<&str> = catalog
            .services_for_phase(phase)
            .into_iter()
            .flat_map(|s| s.routes.iter().map(String::as_str))
            .collect();

        let routes = catalog
            .route_universe()
            .into_iter()
            .map(|route| {
                let target = if migrated.contains(route.as_str()) {
                    RouteTarget::Microservice
                } else {
                    RouteTarget::Legacy
                };
                (route, target)
            })
            .collect();
        Self::from_routes(routes)
    }

    /// Everything on the monolith, proxy mode off
    pub fn legacy(catalog: &Catalog) -> Self {
        Self::for_phase(catalog, MigrationPhase::Uninitialized)
    }

    pub fn target(&self, route: &str) -> Option<RouteTarget> {
        self.routes.get(route).copied()
    }

    pub fn is_fully_legacy(&self) -> bool {
        !self.proxy_mode_enabled && self.routes.values().all(|t| *t == RouteTarget::Legacy)
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Failed to write routing file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize routing table: {0}")]
    Serialize(String),

    #[error("Routing reload `{command}` failed: {reason}")]
    ReloadFailed { command: String, reason: String },

    #[error("Routing store rejected the update: {0}")]
    Rejected(String),
}

pub struct TrafficRouter {
    store: Arc<dyn RoutingStore>,
}

impl TrafficRouter {
    pub fn new(store: Arc<dyn RoutingStore>) -> Self {
        Self { store }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub async fn set_routing(&self, table: &RoutingConfig) -> Result<(), RoutingError> {
        self.store.write(table).await?;
        let migrated = table
            .routes
            .iter()
            .filter(|(_, t)| **t == RouteTarget::Microservice)
            .count();
        info!(
            store = %self.store.describe(),
            proxy_mode = table.proxy_mode_enabled,
            migrated,
            total = table.routes.len(),
            "Routing applied"
        );
        Ok(())
    }
}
