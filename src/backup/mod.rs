//! Backup manager
//!
//! Snapshots stateful resources before risky transitions. Each snapshot lives
//! in its own directory under the backup root, one artifact per resource,
//! with a SHA-256 checksum recorded for every artifact. Records are immutable
//! once created; only an operator prune removes them.

pub mod mock;
pub mod tool;

pub use mock::MockBackupTool;
pub use tool::{BackupTool, LocalBackupTool, ToolError};

use crate::catalog::ResourceSpec;
use crate::state::MigrationPhase;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

const BACKUP_ID_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub file: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub phase_at_creation: MigrationPhase,
    pub resources_included: Vec<String>,
    pub storage_location: PathBuf,
    #[serde(default)]
    pub artifacts: BTreeMap<String, BackupArtifact>,
    /// Resources whose dump failed, with the reason
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed: BTreeMap<String, String>,
    #[serde(default)]
    pub partial: bool,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn is_complete(&self) -> bool {
        !self.partial
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Failed to create backup storage {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup {id} is partial; failed resources: {}", .failed.join(", "))]
    Partial { id: String, failed: Vec<String> },
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Backup storage {path} is missing")]
    MissingStorage { path: PathBuf },

    #[error("Restore of backup {backup_id} failed for: {}", format_failures(.failures))]
    Failed {
        backup_id: String,
        failures: BTreeMap<String, String>,
    },
}

fn format_failures(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(resource, reason)| format!("{} ({})", resource, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Streams `path` through SHA-256
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// [`sha256_file`] on the blocking pool
async fn checksum(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

/// Most recent complete record taken at or before `from` in the rollout
pub fn latest_restorable(records: &[BackupRecord], from: MigrationPhase) -> Option<&BackupRecord> {
    records
        .iter()
        .filter(|r| r.is_complete())
        .filter(|r| r.phase_at_creation.rollout_rank() <= from.rollout_rank())
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

enum Outcome {
    Done(String),
    Skipped(String),
    Failed(String, String),
}

pub struct BackupManager {
    root: PathBuf,
    tool: Arc<dyn BackupTool>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, tool: Arc<dyn BackupTool>) -> Self {
        Self {
            root: root.into(),
            tool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_lock(&self, resource: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource.to_string())
            .or_default()
            .clone()
    }

    fn allocate(&self, now: DateTime<Utc>) -> Result<(String, PathBuf), BackupError> {
        let base = now.format(BACKUP_ID_FORMAT).to_string();
        fs::create_dir_all(&self.root).map_err(|source| BackupError::Storage {
            path: self.root.clone(),
            source,
        })?;

        let mut suffix = 0;
        loop {
            let id = if suffix == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, suffix)
            };
            let location = self.root.join(&id);
            match fs::create_dir(&location) {
                Ok(()) => return Ok((id, location)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(source) => {
                    return Err(BackupError::Storage {
                        path: location,
                        source,
                    })
                }
            }
        }
    }

    /// Dumps every resource concurrently. A failing resource marks the record
    /// partial instead of failing the call; only storage setup errors are
    /// returned as `Err`.
    pub async fn snapshot(
        &self,
        resources: &[&ResourceSpec],
        phase: MigrationPhase,
    ) -> Result<BackupRecord, BackupError> {
        let created_at = Utc::now();
        let (id, location) = self.allocate(created_at)?;
        info!(backup = %id, phase = %phase, resources = resources.len(), "Creating backup");

        let dumps = resources.iter().map(|resource| {
            let location = location.clone();
            async move {
                let lock = self.resource_lock(&resource.name);
                let _held = lock.lock().await;
                let file = self.tool.artifact_name(resource);
                let dest = location.join(&file);
                match self.tool.dump(resource, &dest).await {
                    Ok(()) => match checksum(dest).await {
                        Ok(sha256) => {
                            debug!(resource = %resource.name, sha256 = %sha256, "Resource dumped");
                            Ok((resource.name.clone(), BackupArtifact { file, sha256 }))
                        }
                        Err(e) => Err((resource.name.clone(), format!("checksum: {}", e))),
                    },
                    Err(e) => Err((resource.name.clone(), e.to_string())),
                }
            }
        });

        let mut artifacts = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for result in join_all(dumps).await {
            match result {
                Ok((name, artifact)) => {
                    artifacts.insert(name, artifact);
                }
                Err((name, reason)) => {
                    warn!(backup = %id, resource = %name, reason = %reason, "Resource dump failed");
                    failed.insert(name, reason);
                }
            }
        }

        let record = BackupRecord {
            id,
            phase_at_creation: phase,
            resources_included: artifacts.keys().cloned().collect(),
            storage_location: location,
            partial: !failed.is_empty(),
            artifacts,
            failed,
            created_at,
        };

        if record.partial {
            warn!(backup = %record.id, failed = record.failed.len(), "Backup is partial");
        } else {
            info!(backup = %record.id, location = %record.storage_location.display(), "Backup complete");
        }
        Ok(record)
    }

    /// Restores every resource in `record`. Resources no longer declared in
    /// `resources`, or reported gone by the tool, are skipped with a warning.
    pub async fn restore(
        &self,
        record: &BackupRecord,
        resources: &[ResourceSpec],
    ) -> Result<RestoreSummary, RestoreError> {
        if !record.storage_location.is_dir() {
            return Err(RestoreError::MissingStorage {
                path: record.storage_location.clone(),
            });
        }
        info!(backup = %record.id, "Restoring backup");

        let restores = record.resources_included.iter().map(|name| async move {
            let Some(resource) = resources.iter().find(|r| &r.name == name) else {
                warn!(backup = %record.id, resource = %name, "Resource no longer in catalog, skipping");
                return Outcome::Skipped(name.clone());
            };
            if !self.tool.exists(resource).await {
                warn!(backup = %record.id, resource = %name, "Resource no longer exists, skipping");
                return Outcome::Skipped(name.clone());
            }

            let lock = self.resource_lock(name);
            let _held = lock.lock().await;

            let file = record
                .artifacts
                .get(name)
                .map(|a| a.file.clone())
                .unwrap_or_else(|| self.tool.artifact_name(resource));
            let src = record.storage_location.join(&file);

            if let Some(expected) = record.artifacts.get(name).map(|a| &a.sha256) {
                match checksum(src.clone()).await {
                    Ok(actual) if &actual == expected => {}
                    Ok(actual) => {
                        return Outcome::Failed(
                            name.clone(),
                            format!("checksum mismatch: expected {}, found {}", expected, actual),
                        )
                    }
                    Err(e) => return Outcome::Failed(name.clone(), format!("{}: {}", src.display(), e)),
                }
            }

            match self.tool.restore(resource, &src).await {
                Ok(()) => {
                    info!(backup = %record.id, resource = %name, "Resource restored");
                    Outcome::Done(name.clone())
                }
                Err(e) => Outcome::Failed(name.clone(), e.to_string()),
            }
        });

        let mut summary = RestoreSummary {
            backup_id: record.id.clone(),
            ..Default::default()
        };
        let mut failures = BTreeMap::new();
        for outcome in join_all(restores).await {
            match outcome {
                Outcome::Done(name) => summary.restored.push(name),
                Outcome::Skipped(name) => summary.skipped.push(name),
                Outcome::Failed(name, reason) => {
                    warn!(backup = %record.id, resource = %name, reason = %reason, "Resource restore failed");
                    failures.insert(name, reason);
                }
            }
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(RestoreError::Failed {
                backup_id: record.id.clone(),
                failures,
            })
        }
    }

    /// Keeps the `keep` newest records and deletes the storage of the rest.
    /// Returns `(kept, removed)`.
    pub fn prune(
        &self,
        records: &[BackupRecord],
        keep: usize,
    ) -> (Vec<BackupRecord>, Vec<BackupRecord>) {
        let mut sorted = records.to_vec();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let removed = sorted.split_off(keep.min(sorted.len()));

        for record in &removed {
            match fs::remove_dir_all(&record.storage_location) {
                Ok(()) => info!(backup = %record.id, "Pruned backup"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(backup = %record.id, "Backup storage already gone")
                }
                Err(e) => warn!(backup = %record.id, error = %e, "Failed to delete backup storage"),
            }
        }

        sorted.reverse();
        (sorted, removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, tool: &Arc<MockBackupTool>) -> BackupManager {
        BackupManager::new(dir.path().join("backups"), tool.clone())
    }

    fn record(id: &str, phase: MigrationPhase, partial: bool, age_minutes: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            phase_at_creation: phase,
            resources_included: vec!["labdb".to_string()],
            storage_location: PathBuf::from(format!("/nonexistent/{}", id)),
            artifacts: BTreeMap::new(),
            failed: BTreeMap::new(),
            partial,
            created_at: Utc::now() - ChronoDuration::minutes(age_minutes),
        }
    }

    #[tokio::test]
    async fn test_snapshot_records_checksums() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        let labdb = ResourceSpec::command("labdb", "dump", "restore");
        let uploads = ResourceSpec::directory("uploads", "./uploads");

        let record = manager(&dir, &tool)
            .snapshot(&[&labdb, &uploads], MigrationPhase::Prepared)
            .await
            .unwrap();

        assert!(!record.partial);
        assert_eq!(record.resources_included, vec!["labdb", "uploads"]);
        assert_eq!(record.phase_at_creation, MigrationPhase::Prepared);
        let artifact = &record.artifacts["labdb"];
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(
            sha256_file(&record.storage_location.join(&artifact.file)).unwrap(),
            artifact.sha256
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_checksum_on_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("labdb.dump");
        fs::write(&artifact, "snapshot of labdb").unwrap();

        assert_eq!(checksum(artifact.clone()).await.unwrap(), sha256_file(&artifact).unwrap());
        let missing = checksum(dir.path().join("absent.dump")).await.unwrap_err();
        assert_eq!(missing.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_failed_resource_marks_partial() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        tool.fail_dump_of("uploads");
        let labdb = ResourceSpec::command("labdb", "dump", "restore");
        let uploads = ResourceSpec::directory("uploads", "./uploads");

        let record = manager(&dir, &tool)
            .snapshot(&[&labdb, &uploads], MigrationPhase::Phase1)
            .await
            .unwrap();

        assert!(record.partial);
        assert_eq!(record.failed["uploads"], "scripted dump failure");
        assert_eq!(record.resources_included, vec!["labdb"]);
    }

    #[tokio::test]
    async fn test_snapshot_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        let manager = manager(&dir, &tool);

        let a = manager.snapshot(&[], MigrationPhase::Prepared).await.unwrap();
        let b = manager.snapshot(&[], MigrationPhase::Prepared).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.storage_location, b.storage_location);
    }

    #[tokio::test]
    async fn test_restore_skips_missing_resources() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        let manager = manager(&dir, &tool);
        let labdb = ResourceSpec::command("labdb", "dump", "restore");
        let uploads = ResourceSpec::directory("uploads", "./uploads");
        let record = manager
            .snapshot(&[&labdb, &uploads], MigrationPhase::Phase1)
            .await
            .unwrap();

        tool.remove("uploads");
        let summary = manager
            .restore(&record, &[labdb.clone(), uploads.clone()])
            .await
            .unwrap();
        assert_eq!(summary.restored, vec!["labdb"]);
        assert_eq!(summary.skipped, vec!["uploads"]);

        // Dropped from the catalog entirely
        let summary = manager.restore(&record, &[uploads]).await.unwrap();
        assert_eq!(summary.skipped, vec!["labdb", "uploads"]);
    }

    #[tokio::test]
    async fn test_restore_detects_tampered_artifact() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        let manager = manager(&dir, &tool);
        let labdb = ResourceSpec::command("labdb", "dump", "restore");
        let record = manager.snapshot(&[&labdb], MigrationPhase::Phase1).await.unwrap();

        fs::write(record.storage_location.join("labdb.mock"), "tampered").unwrap();
        let err = manager.restore(&record, &[labdb]).await.unwrap_err();
        assert!(matches!(err, RestoreError::Failed { ref failures, .. } if failures["labdb"].contains("checksum")));
        assert!(tool.restores().is_empty());
    }

    #[tokio::test]
    async fn test_restore_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        let manager = manager(&dir, &tool);
        let labdb = ResourceSpec::command("labdb", "dump", "restore");
        let record = manager.snapshot(&[&labdb], MigrationPhase::Phase2).await.unwrap();

        tool.fail_restore_of("labdb");
        assert!(matches!(
            manager.restore(&record, &[labdb]).await,
            Err(RestoreError::Failed { .. })
        ));
    }

    #[test]
    fn test_latest_restorable_selection() {
        let records = vec![
            record("a", MigrationPhase::Prepared, false, 30),
            record("b", MigrationPhase::Phase1, false, 20),
            record("c", MigrationPhase::Phase2, true, 10),
            record("d", MigrationPhase::Phase3, false, 5),
        ];

        let chosen = latest_restorable(&records, MigrationPhase::Phase2).unwrap();
        assert_eq!(chosen.id, "b");
        let chosen = latest_restorable(&records, MigrationPhase::Prepared).unwrap();
        assert_eq!(chosen.id, "a");
        assert!(latest_restorable(&records, MigrationPhase::Uninitialized).is_none());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(MockBackupTool::new());
        let records = vec![
            record("old", MigrationPhase::Prepared, false, 30),
            record("mid", MigrationPhase::Phase1, false, 20),
            record("new", MigrationPhase::Phase2, false, 10),
        ];

        let (kept, removed) = manager(&dir, &tool).prune(&records, 2);
        assert_eq!(
            kept.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["mid", "new"]
        );
        assert_eq!(removed[0].id, "old");
    }
}
