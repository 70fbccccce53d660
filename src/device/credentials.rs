//! Shared adb credentials
//!
//! The adb server authenticates with the keys in `~/.android`. Devices in a
//! lab may require a specific key pair, delivered as base64 in the device
//! parameter. While any such device is in use, the host's keys are swapped
//! for the lab keys; when the last one is released the original keys are
//! restored. Either swap restarts the adb server.

use base64::Engine as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::common::{Error, Result};
use crate::process::{run_command, ProcessRunner};

const PRIVATE_KEY: &str = "adbkey";
const PUBLIC_KEY: &str = "adbkey.pub";
const BACKUP_EXT: &str = ".devicelab.bak";
/// Present while the host keys are backed up
const SENTINEL: &str = "devicelab.inuse";

/// Key pair carried in an Android device parameter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdbKeys {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "privateKey")]
    pub private_key: String,
}

impl AdbKeys {
    fn decode(value: &str, what: &str) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(value.trim())
            .map_err(|e| Error::Credentials(format!("{} is not valid base64: {}", what, e)))
    }
}

#[derive(Debug, Default)]
struct CacheState {
    instances: usize,
    keys: Option<AdbKeys>,
    using_custom_keys: bool,
}

/// Reference-counted lease on the host's adb key store
pub struct AdbCredentialCache {
    key_dir: PathBuf,
    staging_dir: PathBuf,
    adb: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    settle: Duration,
    state: Mutex<CacheState>,
}

impl AdbCredentialCache {
    /// Create the cache, restoring keys left swapped by an interrupted run
    pub fn new(
        key_dir: PathBuf,
        staging_dir: PathBuf,
        adb: PathBuf,
        runner: Arc<dyn ProcessRunner>,
        settle: Duration,
    ) -> Result<Self> {
        restore_backup_keys(&key_dir)?;
        Ok(Self {
            key_dir,
            staging_dir,
            adb,
            runner,
            settle,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances
    }

    /// Register a device that uses `keys` (or the host's own keys when `None`)
    pub async fn add_instance(&self, keys: Option<&AdbKeys>) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(keys) = keys {
            if keys.public_key.trim().is_empty() || keys.private_key.trim().is_empty() {
                return Err(Error::Credentials("Invalid key in device data".into()));
            }
            if let Some(existing) = &state.keys {
                if existing.private_key != keys.private_key {
                    return Err(Error::Credentials("ADB device private keys must match".into()));
                }
                if existing.public_key != keys.public_key {
                    return Err(Error::Credentials("ADB device public keys must match".into()));
                }
            }

            if state.instances == 0 || !state.using_custom_keys {
                self.install_keys(keys).await?;
                state.using_custom_keys = true;
            }
            state.keys = Some(keys.clone());
        }

        state.instances += 1;
        Ok(())
    }

    /// Release one registration; the last one restores the host keys
    pub async fn remove_instance(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.instances = state.instances.saturating_sub(1);

        if state.instances == 0 && state.using_custom_keys {
            state.keys = None;
            state.using_custom_keys = false;
            restore_backup_keys(&self.key_dir)?;
            self.restart_server().await?;
        }
        Ok(())
    }

    async fn install_keys(&self, keys: &AdbKeys) -> Result<()> {
        let private = AdbKeys::decode(&keys.private_key, "private key")?;
        let public = AdbKeys::decode(&keys.public_key, "public key")?;

        std::fs::create_dir_all(&self.staging_dir)?;
        let staged_private = self.staging_dir.join(PRIVATE_KEY);
        let staged_public = self.staging_dir.join(PUBLIC_KEY);
        std::fs::write(&staged_private, private)?;
        std::fs::write(&staged_public, public)?;

        tracing::info!("Using adb keys at {}", self.staging_dir.display());

        std::fs::create_dir_all(&self.key_dir)?;
        let local_private = self.key_dir.join(PRIVATE_KEY);
        let local_public = self.key_dir.join(PUBLIC_KEY);
        let sentinel = self.key_dir.join(SENTINEL);

        if !sentinel.exists() {
            backup(&local_private)?;
            backup(&local_public)?;
            std::fs::write(&sentinel, "placeholder")?;
        }

        std::fs::copy(&staged_private, &local_private)?;
        std::fs::copy(&staged_public, &local_public)?;

        self.restart_server().await
    }

    async fn restart_server(&self) -> Result<()> {
        tracing::info!("Running adb kill-server to refresh credentials");
        run_command(
            self.runner.as_ref(),
            &self.adb,
            &["kill-server".to_string()],
            Duration::from_secs(60),
        )
        .await?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_EXT);
    PathBuf::from(name)
}

fn backup(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::copy(path, backup_path(path))?;
    }
    Ok(())
}

fn restore(path: &Path) -> Result<()> {
    let saved = backup_path(path);
    if saved.exists() {
        std::fs::copy(&saved, path)?;
        std::fs::remove_file(&saved)?;
    } else if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Put the host's original keys back if a backup is in place
pub fn restore_backup_keys(key_dir: &Path) -> Result<()> {
    let sentinel = key_dir.join(SENTINEL);
    if !sentinel.exists() {
        return Ok(());
    }

    tracing::info!("Restoring original adb keys");
    restore(&key_dir.join(PRIVATE_KEY))?;
    restore(&key_dir.join(PUBLIC_KEY))?;
    std::fs::remove_file(&sentinel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::scripted::{Scripted, ScriptedRunner};
    use base64::engine::general_purpose::STANDARD;
    use std::fs;

    fn keys(private: &str, public: &str) -> AdbKeys {
        AdbKeys {
            private_key: STANDARD.encode(private),
            public_key: STANDARD.encode(public),
        }
    }

    fn cache(dir: &Path, runner: Arc<ScriptedRunner>) -> AdbCredentialCache {
        AdbCredentialCache::new(
            dir.join("home/.android"),
            dir.join("staging"),
            PathBuf::from("adb"),
            runner,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("home/.android");
        fs::create_dir_all(&key_dir).unwrap();
        fs::write(key_dir.join(PRIVATE_KEY), "host-private").unwrap();
        fs::write(key_dir.join(PUBLIC_KEY), "host-public").unwrap();

        let runner = Arc::new(ScriptedRunner::new(|_| Scripted::ok("")));
        let cache = cache(dir.path(), runner.clone());
        let lab = keys("lab-private", "lab-public");

        cache.add_instance(Some(&lab)).await.unwrap();
        cache.add_instance(Some(&lab)).await.unwrap();
        assert_eq!(cache.instance_count().await, 2);
        assert_eq!(
            fs::read_to_string(key_dir.join(PRIVATE_KEY)).unwrap(),
            "lab-private"
        );
        assert!(key_dir.join(SENTINEL).exists());
        assert_eq!(runner.count("kill-server"), 1);

        cache.remove_instance().await.unwrap();
        assert_eq!(runner.count("kill-server"), 1);
        cache.remove_instance().await.unwrap();

        assert_eq!(
            fs::read_to_string(key_dir.join(PRIVATE_KEY)).unwrap(),
            "host-private"
        );
        assert_eq!(
            fs::read_to_string(key_dir.join(PUBLIC_KEY)).unwrap(),
            "host-public"
        );
        assert!(!key_dir.join(SENTINEL).exists());
        assert_eq!(runner.count("kill-server"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| Scripted::ok("")));
        let cache = cache(dir.path(), runner);

        cache
            .add_instance(Some(&keys("a-private", "a-public")))
            .await
            .unwrap();
        let err = cache
            .add_instance(Some(&keys("b-private", "a-public")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
        assert_eq!(cache.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_host_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| Scripted::ok("")));
        let cache = cache(dir.path(), runner.clone());

        cache.add_instance(None).await.unwrap();
        cache.remove_instance().await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_interrupted_run_restored_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join(".android");
        fs::create_dir_all(&key_dir).unwrap();
        fs::write(key_dir.join(PRIVATE_KEY), "lab").unwrap();
        fs::write(backup_path(&key_dir.join(PRIVATE_KEY)), "host").unwrap();
        fs::write(key_dir.join(SENTINEL), "placeholder").unwrap();

        restore_backup_keys(&key_dir).unwrap();
        assert_eq!(fs::read_to_string(key_dir.join(PRIVATE_KEY)).unwrap(), "host");
        assert!(!key_dir.join(PUBLIC_KEY).exists());
        assert!(!key_dir.join(SENTINEL).exists());
    }
}
