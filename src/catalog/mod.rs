//! Service catalog
//!
//! Read-only description of every service, stateful resource and phase of a
//! deployment, loaded from YAML and validated once up front so that a bad
//! catalog fails before any service is touched.
//!
//! # Example
//!
//! ```
//! use rollout::catalog::Catalog;
//! use rollout::state::MigrationPhase;
//!
//! let catalog = Catalog::from_yaml_str(r#"
//! services:
//!   - name: auth
//!     tier: 0
//!     start: lab/auth:latest
//!     health: { url: "http://localhost:8081/health" }
//!     phases: [phase1]
//!     routes: [auth]
//! "#).unwrap();
//!
//! let phase1 = catalog.services_for_phase(MigrationPhase::Phase1);
//! assert_eq!(phase1.len(), 1);
//! ```

pub mod types;

pub use types::{
    CatalogFile, HealthCheck, PhasePlan, ResourceKind, ResourceSpec, ServiceSpec,
};

use crate::state::MigrationPhase;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Catalog loading and validation errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog: {0}")]
    Parse(String),

    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("Resource '{0}' is declared more than once")]
    DuplicateResource(String),

    #[error("Service '{service}' is invalid: {reason}")]
    InvalidService { service: String, reason: String },

    #[error("Service '{service}' depends on undeclared service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error(
        "Service '{service}' (tier {tier}) declares a lower tier than its dependency '{dependency}' (tier {dependency_tier})"
    )]
    TierInversion {
        service: String,
        tier: u32,
        dependency: String,
        dependency_tier: u32,
    },

    #[error("Phase {phase} references undeclared service '{service}'")]
    UndeclaredService {
        phase: MigrationPhase,
        service: String,
    },

    #[error("Phase {phase} references undeclared resource '{resource}'")]
    UnknownResource {
        phase: MigrationPhase,
        resource: String,
    },

    #[error("Service '{service}' cannot be a member of phase {phase}")]
    InvalidPhaseMembership {
        service: String,
        phase: MigrationPhase,
    },

    #[error("Phase {0} cannot be configured in the catalog")]
    UndeclarablePhase(MigrationPhase),

    #[error("Resource '{resource}' is invalid: {reason}")]
    InvalidResource { resource: String, reason: String },
}

/// Validated service catalog
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: Vec<ServiceSpec>,
    index: HashMap<String, usize>,
    resources: Vec<ResourceSpec>,
    phases: BTreeMap<MigrationPhase, PhasePlan>,
    routes: Vec<String>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_yaml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    pub fn from_file(file: CatalogFile) -> Result<Self, CatalogError> {
        let mut index = HashMap::new();
        for (i, service) in file.services.iter().enumerate() {
            if index.insert(service.name.clone(), i).is_some() {
                return Err(CatalogError::DuplicateService(service.name.clone()));
            }
        }

        let catalog = Self {
            services: file.services,
            index,
            resources: file.resources,
            phases: file.phases,
            routes: file.routes,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Convenience constructor used by tests and embedders
    pub fn with_services(services: Vec<ServiceSpec>) -> Result<Self, CatalogError> {
        Self::from_file(CatalogFile {
            services,
            ..Default::default()
        })
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(CatalogError::InvalidService {
                    service: service.name.clone(),
                    reason: "name is empty".to_string(),
                });
            }
            if service.start_ref.trim().is_empty() {
                return Err(CatalogError::InvalidService {
                    service: service.name.clone(),
                    reason: "start reference is empty".to_string(),
                });
            }
            if service.health_check.expect.is_empty() {
                return Err(CatalogError::InvalidService {
                    service: service.name.clone(),
                    reason: "health check accepts no status code".to_string(),
                });
            }

            for phase in &service.required_in_phases {
                if !phase.is_declarable() {
                    return Err(CatalogError::InvalidPhaseMembership {
                        service: service.name.clone(),
                        phase: *phase,
                    });
                }
            }

            for dependency in &service.depends_on {
                let dep = self.service(dependency).ok_or_else(|| {
                    CatalogError::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                if service.tier < dep.tier {
                    return Err(CatalogError::TierInversion {
                        service: service.name.clone(),
                        tier: service.tier,
                        dependency: dep.name.clone(),
                        dependency_tier: dep.tier,
                    });
                }
            }
        }

        let mut seen = BTreeSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.name.as_str()) {
                return Err(CatalogError::DuplicateResource(resource.name.clone()));
            }
            let missing = match resource.kind {
                ResourceKind::Directory if resource.path.is_none() => Some("path"),
                ResourceKind::Command if resource.dump.is_none() => Some("dump"),
                ResourceKind::Command if resource.restore.is_none() => Some("restore"),
                _ => None,
            };
            if let Some(field) = missing {
                return Err(CatalogError::InvalidResource {
                    resource: resource.name.clone(),
                    reason: format!("missing '{}'", field),
                });
            }
        }

        for (phase, plan) in &self.phases {
            if !phase.is_declarable() {
                return Err(CatalogError::UndeclarablePhase(*phase));
            }
            for name in &plan.services {
                if self.service(name).is_none() {
                    return Err(CatalogError::UndeclaredService {
                        phase: *phase,
                        service: name.clone(),
                    });
                }
            }
            for name in &plan.backup {
                if self.resource(name).is_none() {
                    return Err(CatalogError::UnknownResource {
                        phase: *phase,
                        resource: name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn phase_plan(&self, phase: MigrationPhase) -> PhasePlan {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    fn membership_phase(phase: MigrationPhase) -> Option<MigrationPhase> {
        match phase {
            MigrationPhase::Uninitialized => None,
            MigrationPhase::RolledBack => Some(MigrationPhase::Prepared),
            other => Some(other),
        }
    }

    /// Services that must be running while `phase` is current, ordered by
    /// tier then name.
    pub fn services_for_phase(&self, phase: MigrationPhase) -> Vec<&ServiceSpec> {
        let Some(phase) = Self::membership_phase(phase) else {
            return Vec::new();
        };
        let extra = self
            .phases
            .get(&phase)
            .map(|plan| plan.services.as_slice())
            .unwrap_or_default();

        let mut services: Vec<&ServiceSpec> = self
            .services
            .iter()
            .filter(|s| s.required_in_phases.contains(&phase) || extra.contains(&s.name))
            .collect();
        services.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
        services
    }

    pub fn required_names(&self, phase: MigrationPhase) -> BTreeSet<String> {
        self.services_for_phase(phase)
            .into_iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Groups services into ascending tiers
    pub fn tier_order<'a>(services: &[&'a ServiceSpec]) -> Vec<(u32, Vec<&'a ServiceSpec>)> {
        let mut tiers: BTreeMap<u32, Vec<&'a ServiceSpec>> = BTreeMap::new();
        for service in services {
            tiers.entry(service.tier).or_default().push(service);
        }
        tiers.into_iter().collect()
    }

    /// Every logical route known to the deployment
    pub fn route_universe(&self) -> BTreeSet<String> {
        self.routes
            .iter()
            .cloned()
            .chain(self.services.iter().flat_map(|s| s.routes.iter().cloned()))
            .collect()
    }

    /// Resources to snapshot before entering `phase`, empty when not risky
    pub fn backup_resources(&self, phase: MigrationPhase) -> Vec<&ResourceSpec> {
        let plan = self.phase_plan(phase);
        if !plan.risky {
            return Vec::new();
        }
        if plan.backup.is_empty() {
            return self.resources.iter().collect();
        }
        plan.backup
            .iter()
            .filter_map(|name| self.resource(name))
            .collect()
    }
}
