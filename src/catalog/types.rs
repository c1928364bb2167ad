//! Catalog entry types as they appear in the catalog YAML

use crate::state::MigrationPhase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

fn default_expect() -> Vec<u16> {
    vec![200]
}

/// Health endpoint and the predicate a poll must satisfy to count as healthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// `http(s)://` endpoint, or `tcp://host:port` for a plain connect check
    pub url: String,

    /// Accepted status codes. `[200, 404]` distinguishes "reachable" from
    /// "down" on routes that are valid but return no content.
    #[serde(default = "default_expect")]
    pub expect: Vec<u16>,

    /// Substring the response body must contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,
}

impl HealthCheck {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expect: default_expect(),
            body_contains: None,
        }
    }

    pub fn with_expect(mut self, expect: Vec<u16>) -> Self {
        self.expect = expect;
        self
    }

    pub fn with_body(mut self, needle: impl Into<String>) -> Self {
        self.body_contains = Some(needle.into());
        self
    }

    pub fn accepts(&self, status: u16, body: &str) -> bool {
        if !self.expect.contains(&status) {
            return false;
        }
        match &self.body_contains {
            Some(needle) => body.contains(needle.as_str()),
            None => true,
        }
    }
}

/// Immutable descriptor of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    /// Dependency rank; lower tiers are started and healthy first
    #[serde(default)]
    pub tier: u32,

    /// Opaque reference the launcher understands: an image for the Docker
    /// launcher, a command line for the process launcher
    #[serde(rename = "start")]
    pub start_ref: String,

    #[serde(rename = "health")]
    pub health_check: HealthCheck,

    #[serde(default, rename = "phases")]
    pub required_in_phases: BTreeSet<MigrationPhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Logical routes this service takes over from the legacy implementation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Ports published on the host with the same number
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, tier: u32, start_ref: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            health_check: HealthCheck::http(format!("http://localhost/{}/health", name)),
            name,
            tier,
            start_ref: start_ref.into(),
            required_in_phases: BTreeSet::new(),
            depends_on: Vec::new(),
            routes: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
        }
    }

    pub fn with_health(mut self, health_check: HealthCheck) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn in_phases(mut self, phases: impl IntoIterator<Item = MigrationPhase>) -> Self {
        self.required_in_phases.extend(phases);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn serving(mut self, route: impl Into<String>) -> Self {
        self.routes.push(route.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Host directory (bind-mounted volume) archived as tar.gz
    Directory,
    /// External dump/restore commands with `{dest}` / `{src}` placeholders
    Command,
}

/// Stateful resource that can be snapshotted before risky transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<String>,
}

impl ResourceSpec {
    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Directory,
            path: Some(path.into()),
            dump: None,
            restore: None,
        }
    }

    pub fn command(
        name: impl Into<String>,
        dump: impl Into<String>,
        restore: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Command,
            path: None,
            dump: Some(dump.into()),
            restore: Some(restore.into()),
        }
    }
}

/// Per-phase settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// Touches shared state; a backup is taken before entering the phase
    #[serde(default)]
    pub risky: bool,

    /// Resources to snapshot; empty on a risky phase means all resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup: Vec<String>,

    /// Extra services required in this phase, by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Raw catalog document before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub phases: BTreeMap<MigrationPhase, PhasePlan>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_default_expect() {
        let check: HealthCheck = serde_yaml::from_str("url: http://localhost:8080/health").unwrap();
        assert_eq!(check.expect, vec![200]);
        assert!(check.accepts(200, ""));
        assert!(!check.accepts(404, ""));
    }

    #[test]
    fn test_health_check_whitelist() {
        let check = HealthCheck::http("http://localhost:3000/").with_expect(vec![200, 404]);
        assert!(check.accepts(404, ""));
        assert!(!check.accepts(503, ""));
    }

    #[test]
    fn test_health_check_body_predicate() {
        let check = HealthCheck::http("http://localhost:8080/health").with_body("\"UP\"");
        assert!(check.accepts(200, "{\"status\":\"UP\"}"));
        assert!(!check.accepts(200, "{\"status\":\"DOWN\"}"));
    }

    #[test]
    fn test_service_spec_yaml() {
        let yaml = r#"
name: auth
tier: 1
start: lab/auth-service:latest
depends_on: [postgres]
health:
  url: http://localhost:8081/health
phases: [phase1, phase2]
routes: [auth]
"#;
        let spec: ServiceSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.name, "auth");
        assert_eq!(spec.start_ref, "lab/auth-service:latest");
        assert!(spec.required_in_phases.contains(&MigrationPhase::Phase2));
        assert_eq!(spec.routes, vec!["auth".to_string()]);
    }

    #[test]
    fn test_resource_kinds() {
        let yaml = r#"
- name: uploads
  kind: directory
  path: ./data/uploads
- name: labdb
  kind: command
  dump: "pg_dump lab > {dest}"
  restore: "psql lab < {src}"
"#;
        let resources: Vec<ResourceSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resources[0].kind, ResourceKind::Directory);
        assert_eq!(resources[1].kind, ResourceKind::Command);
        assert_eq!(resources[1].dump.as_deref(), Some("pg_dump lab > {dest}"));
    }
}
