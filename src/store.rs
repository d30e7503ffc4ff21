//! Package store: on-disk materialization of extension packages.
//!
//! Packages are VSIX archives (zip files whose payload lives under
//! `extension/`). Each call is atomic on its own: extraction goes to a
//! staging directory that is renamed into place once complete.

use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

/// Folder inside a VSIX that holds the extension payload
const VSIX_PAYLOAD_DIR: &str = "extension";

/// Errors from package store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid package archive: {0}")]
    Archive(String),

    #[error("Unsafe path in package: {0}")]
    UnsafePath(String),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Filesystem collaborator used for installs and contribution loading
#[async_trait]
pub trait PackageStore: Send + Sync {
    /// Unpack `package` into `target`, replacing anything already there
    async fn extract(&self, package: &[u8], target: &Path) -> Result<(), StoreError>;
    async fn remove(&self, path: &Path) -> Result<(), StoreError>;
    async fn read_to_string(&self, path: &Path) -> Result<String, StoreError>;
    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, StoreError>;
    async fn exists(&self, path: &Path) -> bool;
}

/// [`PackageStore`] on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsPackageStore;

impl FsPackageStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PackageStore for FsPackageStore {
    async fn extract(&self, package: &[u8], target: &Path) -> Result<(), StoreError> {
        let package = package.to_vec();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || extract_vsix(&package, &target))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn remove(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_to_string(&self, path: &Path) -> Result<String, StoreError> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Archive entry path relative to the extension root, or `None` to skip it
fn payload_path(entry: &Path, has_payload_dir: bool) -> Option<PathBuf> {
    if !has_payload_dir {
        return Some(entry.to_path_buf());
    }
    entry
        .strip_prefix(VSIX_PAYLOAD_DIR)
        .ok()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn extract_vsix(package: &[u8], target: &Path) -> Result<(), StoreError> {
    let mut archive =
        ZipArchive::new(Cursor::new(package)).map_err(|e| StoreError::Archive(e.to_string()))?;

    let has_payload_dir = archive
        .file_names()
        .any(|name| name.starts_with("extension/"));

    let mut staging_name = target.file_name().unwrap_or_default().to_os_string();
    staging_name.push(".partial");
    let staging = target.with_file_name(staging_name);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let mut written = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| StoreError::Archive(e.to_string()))?;
        let name = entry.name().to_string();
        let enclosed = entry
            .enclosed_name()
            .ok_or_else(|| StoreError::UnsafePath(name.clone()))?;
        if enclosed
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(StoreError::UnsafePath(name));
        }
        let Some(relative) = payload_path(&enclosed, has_payload_dir) else {
            continue;
        };

        let out = staging.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out)?;
        io::copy(&mut entry, &mut out_file)?;
        written += 1;
    }

    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    fs::rename(&staging, target)?;
    debug!(target = ?target, files = written, "Extracted package");
    Ok(())
}
