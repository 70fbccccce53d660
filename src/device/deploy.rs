//! Differential deployment
//!
//! For every artifact we keep a dependency record on the device, named after
//! a hash of the destination, holding `"<localModTime>###<remoteFileInfo>"`.
//! When both the local modification time and the remote file information
//! still match the record, the transfer is skipped.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::common::{Error, Result};

/// Separator between the two halves of a record
pub const RECORD_SEPARATOR: &str = "###";

/// What is being deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployKind {
    /// An installable package, fingerprinted by its install time
    Package { package_name: String },
    /// A plain file copied to `destination`
    File,
}

/// One artifact to deploy
#[derive(Debug, Clone)]
pub struct DeployItem {
    pub source: PathBuf,
    pub destination: String,
    pub kind: DeployKind,
}

impl DeployItem {
    pub fn file(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind: DeployKind::File,
        }
    }

    pub fn package(source: impl Into<PathBuf>, package_name: &str) -> Self {
        Self {
            source: source.into(),
            destination: format!("package:{}", package_name),
            kind: DeployKind::Package {
                package_name: package_name.to_string(),
            },
        }
    }
}

/// Outcome of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Skipped,
    Transferred,
}

/// Moves artifacts to a target and stores dependency records there
#[async_trait]
pub trait DeployTransport: Send + Sync {
    /// Information about the deployed artifact, `None` if it is absent
    async fn remote_file_info(&self, item: &DeployItem) -> Result<Option<String>>;

    /// Content of a dependency record, `None` if there is none
    async fn read_record(&self, record_path: &str) -> Result<Option<String>>;

    async fn write_record(&self, record_path: &str, content: &str) -> Result<()>;

    async fn transfer(&self, item: &DeployItem) -> Result<()>;
}

/// Path of the record for `destination` inside `record_dir`
pub fn record_path(record_dir: &str, destination: &str) -> String {
    let digest = Sha256::digest(destination.as_bytes());
    format!(
        "{}/{}",
        record_dir.trim_end_matches('/'),
        hex::encode_upper(&digest[..8])
    )
}

/// Modification time of a local file in milliseconds since the epoch
pub async fn local_mod_time(path: &Path) -> Result<String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
    let modified = metadata.modified()?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok(millis.to_string())
}

/// Whether a stored record matches the current fingerprint and file info
pub fn record_matches(record: &str, local_time: &str, remote_info: &str) -> bool {
    let parts: Vec<&str> = record
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    parts.len() >= 2 && parts[0] == local_time && parts[1] == remote_info.trim()
}

/// Deploy `item` unless the target already has this exact version
///
/// With `force` the record is ignored. Transfer errors are returned as-is;
/// a failure to write the record only costs a redundant transfer next time.
pub async fn deploy(
    transport: &dyn DeployTransport,
    record_dir: &str,
    item: &DeployItem,
    force: bool,
) -> Result<DeployOutcome> {
    let local_time = local_mod_time(&item.source).await?;
    let record = record_path(record_dir, &item.destination);

    if !force {
        if let Some(info) = transport.remote_file_info(item).await? {
            if let Some(existing) = transport.read_record(&record).await? {
                if record_matches(&existing, &local_time, &info) {
                    tracing::info!(
                        "Skipping {} - remote copy up to date",
                        item.source.display()
                    );
                    return Ok(DeployOutcome::Skipped);
                }
            }
        }
    }

    tracing::info!("Deploying {} to {}", item.source.display(), item.destination);
    transport.transfer(item).await?;

    let info = transport.remote_file_info(item).await?.unwrap_or_default();
    let content = format!("{}{}{}", local_time, RECORD_SEPARATOR, info.trim());
    if let Err(e) = transport.write_record(&record, &content).await {
        tracing::warn!("Failed to write dependency record {}: {}", record, e);
    }

    Ok(DeployOutcome::Transferred)
}

/// Deploys onto the local filesystem (host sandboxes)
pub struct LocalTransport;

#[async_trait]
impl DeployTransport for LocalTransport {
    async fn remote_file_info(&self, item: &DeployItem) -> Result<Option<String>> {
        match tokio::fs::metadata(&item.destination).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                Ok(Some(format!("{} {}", meta.len(), modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_record(&self, record_path: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(record_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, record_path: &str, content: &str) -> Result<()> {
        if let Some(parent) = Path::new(record_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(record_path, content).await?;
        Ok(())
    }

    async fn transfer(&self, item: &DeployItem) -> Result<()> {
        let destination = Path::new(&item.destination);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&item.source, destination)
            .await
            .map_err(|e| {
                Error::transfer(
                    "localhost",
                    &item.source.display().to_string(),
                    &item.destination,
                    &e.to_string(),
                )
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_record_path_is_stable() {
        let a = record_path("/sdcard/gdeps/", "/sdcard/obb/main.obb");
        let b = record_path("/sdcard/gdeps", "/sdcard/obb/main.obb");
        assert_eq!(a, b);
        assert!(a.starts_with("/sdcard/gdeps/"));
        assert_eq!(a.len(), "/sdcard/gdeps/".len() + 16);
        assert_ne!(a, record_path("/sdcard/gdeps", "/sdcard/obb/patch.obb"));
    }

    #[test]
    fn test_record_matches() {
        assert!(record_matches("123###-rw-rw---- 1 root 42 a.obb\n", "123", "-rw-rw---- 1 root 42 a.obb"));
        assert!(!record_matches("123###info", "124", "info"));
        assert!(!record_matches("123###info", "123", "other"));
        assert!(!record_matches("garbage", "123", "info"));
    }

    #[tokio::test]
    async fn test_unchanged_artifact_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pak0.pak");
        std::fs::write(&source, b"data").unwrap();
        let dest = dir.path().join("sandbox/Content/pak0.pak");
        let records = dir.path().join("deps");
        let records = records.to_string_lossy();

        let item = DeployItem::file(&source, dest.to_string_lossy());

        let first = deploy(&LocalTransport, &records, &item, false).await.unwrap();
        assert_eq!(first, DeployOutcome::Transferred);
        assert!(dest.exists());

        let second = deploy(&LocalTransport, &records, &item, false).await.unwrap();
        assert_eq!(second, DeployOutcome::Skipped);

        let later = SystemTime::now() + Duration::from_secs(120);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let third = deploy(&LocalTransport, &records, &item, false).await.unwrap();
        assert_eq!(third, DeployOutcome::Transferred);
        let fourth = deploy(&LocalTransport, &records, &item, false).await.unwrap();
        assert_eq!(fourth, DeployOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_force_always_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Engine.ini");
        std::fs::write(&source, b"[Core.Log]").unwrap();
        let dest = dir.path().join("out/Engine.ini");
        let records = dir.path().join("deps");
        let item = DeployItem::file(&source, dest.to_string_lossy());

        deploy(&LocalTransport, &records.to_string_lossy(), &item, false)
            .await
            .unwrap();
        let forced = deploy(&LocalTransport, &records.to_string_lossy(), &item, true)
            .await
            .unwrap();
        assert_eq!(forced, DeployOutcome::Transferred);
    }

    #[tokio::test]
    async fn test_missing_source_is_error() {
        let item = DeployItem::file("/nonexistent/a.pak", "/tmp/a.pak");
        assert!(deploy(&LocalTransport, "/tmp/deps", &item, false)
            .await
            .is_err());
    }
}
