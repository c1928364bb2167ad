//! Dump/restore actions per resource kind

use crate::catalog::{ResourceKind, ResourceSpec};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("resource '{resource}' has no {what}")]
    NotConfigured { resource: String, what: &'static str },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Rejected(String),

    #[error("archive worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ToolError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait BackupTool: Send + Sync {
    /// File name of the artifact `dump` writes for `resource`
    fn artifact_name(&self, resource: &ResourceSpec) -> String;

    async fn dump(&self, resource: &ResourceSpec, dest: &Path) -> Result<(), ToolError>;

    async fn restore(&self, resource: &ResourceSpec, src: &Path) -> Result<(), ToolError>;

    /// False when the resource is gone and a restore should be skipped
    async fn exists(&self, resource: &ResourceSpec) -> bool;
}

/// Directory archives via tar+gzip, external commands via `sh -c`
#[derive(Debug, Default, Clone)]
pub struct LocalBackupTool;

impl LocalBackupTool {
    pub fn new() -> Self {
        Self
    }

    fn directory(resource: &ResourceSpec) -> Result<PathBuf, ToolError> {
        resource.path.clone().ok_or_else(|| ToolError::NotConfigured {
            resource: resource.name.clone(),
            what: "path",
        })
    }

    fn template<'a>(
        resource: &ResourceSpec,
        template: &'a Option<String>,
        what: &'static str,
    ) -> Result<&'a str, ToolError> {
        template.as_deref().ok_or_else(|| ToolError::NotConfigured {
            resource: resource.name.clone(),
            what,
        })
    }

    async fn run_shell(command: &str) -> Result<(), ToolError> {
        debug!(command = %command, "Running backup command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ToolError::CommandFailed {
                command: command.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Single-quotes a path for `sh -c`
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

pub fn archive_directory(source: &Path, dest: &Path) -> Result<(), ToolError> {
    let file = File::create(dest).map_err(ToolError::io("creating", dest))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", source)
        .map_err(ToolError::io("archiving", source))?;
    let encoder = builder.into_inner().map_err(ToolError::io("writing", dest))?;
    encoder.finish().map_err(ToolError::io("writing", dest))?;
    Ok(())
}

/// Replaces the contents of `target` with the archive at `src`
pub fn extract_archive(src: &Path, target: &Path) -> Result<(), ToolError> {
    let file = File::open(src).map_err(ToolError::io("opening", src))?;
    if target.exists() {
        fs::remove_dir_all(target).map_err(ToolError::io("clearing", target))?;
    }
    fs::create_dir_all(target).map_err(ToolError::io("creating", target))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(target)
        .map_err(ToolError::io("extracting into", target))
}

#[async_trait]
impl BackupTool for LocalBackupTool {
    fn artifact_name(&self, resource: &ResourceSpec) -> String {
        match resource.kind {
            ResourceKind::Directory => format!("{}.tar.gz", resource.name),
            ResourceKind::Command => format!("{}.dump", resource.name),
        }
    }

    async fn dump(&self, resource: &ResourceSpec, dest: &Path) -> Result<(), ToolError> {
        match resource.kind {
            ResourceKind::Directory => {
                let source = Self::directory(resource)?;
                let dest = dest.to_path_buf();
                tokio::task::spawn_blocking(move || archive_directory(&source, &dest)).await?
            }
            ResourceKind::Command => {
                let template = Self::template(resource, &resource.dump, "dump")?;
                Self::run_shell(&template.replace("{dest}", &shell_quote(dest))).await
            }
        }
    }

    async fn restore(&self, resource: &ResourceSpec, src: &Path) -> Result<(), ToolError> {
        match resource.kind {
            ResourceKind::Directory => {
                let target = Self::directory(resource)?;
                let src = src.to_path_buf();
                tokio::task::spawn_blocking(move || extract_archive(&src, &target)).await?
            }
            ResourceKind::Command => {
                let template = Self::template(resource, &resource.restore, "restore")?;
                Self::run_shell(&template.replace("{src}", &shell_quote(src))).await
            }
        }
    }

    async fn exists(&self, resource: &ResourceSpec) -> bool {
        match resource.kind {
            ResourceKind::Directory => resource.path.as_deref().is_some_and(Path::exists),
            ResourceKind::Command => true,
        }
    }
}
