use super::tool::{BackupTool, ToolError};
use crate::catalog::ResourceSpec;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Backup tool that writes a marker artifact and records every call
#[derive(Default)]
pub struct MockBackupTool {
    fail_dump: Mutex<BTreeSet<String>>,
    fail_restore: Mutex<BTreeSet<String>>,
    missing: Mutex<BTreeSet<String>>,
    dumps: Mutex<Vec<String>>,
    restores: Mutex<Vec<String>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBackupTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_dump_of(&self, resource: impl Into<String>) {
        guard(&self.fail_dump).insert(resource.into());
    }

    pub fn fail_restore_of(&self, resource: impl Into<String>) {
        guard(&self.fail_restore).insert(resource.into());
    }

    pub fn clear_failures(&self) {
        guard(&self.fail_dump).clear();
        guard(&self.fail_restore).clear();
    }

    /// Reports `resource` as gone so restores skip it
    pub fn remove(&self, resource: impl Into<String>) {
        guard(&self.missing).insert(resource.into());
    }

    pub fn dumps(&self) -> Vec<String> {
        guard(&self.dumps).clone()
    }

    pub fn restores(&self) -> Vec<String> {
        guard(&self.restores).clone()
    }
}

#[async_trait]
impl BackupTool for MockBackupTool {
    fn artifact_name(&self, resource: &ResourceSpec) -> String {
        format!("{}.mock", resource.name)
    }

    async fn dump(&self, resource: &ResourceSpec, dest: &Path) -> Result<(), ToolError> {
        if guard(&self.fail_dump).contains(&resource.name) {
            return Err(ToolError::Rejected("scripted dump failure".to_string()));
        }
        tokio::fs::write(dest, format!("snapshot of {}", resource.name))
            .await
            .map_err(|source| ToolError::Io {
                action: "writing",
                path: dest.to_path_buf(),
                source,
            })?;
        guard(&self.dumps).push(resource.name.clone());
        Ok(())
    }

    async fn restore(&self, resource: &ResourceSpec, _src: &Path) -> Result<(), ToolError> {
        if guard(&self.fail_restore).contains(&resource.name) {
            return Err(ToolError::Rejected("scripted restore failure".to_string()));
        }
        guard(&self.restores).push(resource.name.clone());
        Ok(())
    }

    async fn exists(&self, resource: &ResourceSpec) -> bool {
        !guard(&self.missing).contains(&resource.name)
    }
}
