//! Pool of configured devices
//!
//! Devices are opened lazily on reservation and dropped on release, so each
//! session gets a freshly connected device. A device that fails to connect,
//! install or launch is marked as a problem and skipped from then on.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Device, DeviceRegistry};
use crate::build::Platform;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::context::HostServices;

const HOST_DEVICE: &str = "localhost";

struct PoolEntry {
    platform: Platform,
    name: String,
    param: Option<String>,
    device: Option<Arc<dyn Device>>,
    reserved: bool,
    problem: Option<String>,
}

impl PoolEntry {
    fn new(platform: Platform, name: &str, param: Option<String>) -> Self {
        Self {
            platform,
            name: name.to_string(),
            param,
            device: None,
            reserved: false,
            problem: None,
        }
    }

    fn matches(&self, device: &str) -> bool {
        self.name == device || self.device.as_ref().is_some_and(|d| d.name() == device)
    }

    fn holds(&self, device: &Arc<dyn Device>) -> bool {
        self.device.as_ref().is_some_and(|d| Arc::ptr_eq(d, device))
    }
}

/// Listing of one pool entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub platform: Platform,
    pub name: String,
    pub reserved: bool,
    pub problem: Option<String>,
}

/// The devices available to this run
pub struct DevicePool {
    entries: Mutex<Vec<PoolEntry>>,
}

impl DevicePool {
    pub fn empty() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Entries from the configuration, plus the host machine
    pub fn from_config(config: &Config) -> Self {
        let mut entries: Vec<PoolEntry> = config
            .devices
            .iter()
            .map(|d| PoolEntry::new(d.platform, &d.name, d.param.clone()))
            .collect();
        let host = Platform::host();
        if !entries.iter().any(|e| e.platform == host) {
            entries.push(PoolEntry::new(host, HOST_DEVICE, None));
        }
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub async fn add(&self, platform: Platform, name: &str, param: Option<String>) {
        self.entries
            .lock()
            .await
            .push(PoolEntry::new(platform, name, param));
    }

    pub async fn status(&self) -> Vec<PoolStatus> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| PoolStatus {
                platform: e.platform,
                name: e
                    .device
                    .as_ref()
                    .map(|d| d.name().to_string())
                    .unwrap_or_else(|| e.name.clone()),
                reserved: e.reserved,
                problem: e.problem.clone(),
            })
            .collect()
    }

    /// Reserve one connected device per requested platform
    ///
    /// Either every platform gets a device or nothing stays reserved.
    pub async fn reserve(
        &self,
        services: &Arc<HostServices>,
        registry: &DeviceRegistry,
        platforms: &[Platform],
    ) -> Result<Vec<Arc<dyn Device>>> {
        let mut entries = self.entries.lock().await;
        let mut reserved: Vec<usize> = Vec::new();

        for &platform in platforms {
            match Self::reserve_one(services, registry, &mut entries, platform).await {
                Some(index) => reserved.push(index),
                None => {
                    for index in reserved {
                        let entry = &mut entries[index];
                        entry.reserved = false;
                        if let Some(device) = entry.device.take() {
                            if let Err(e) = device.disconnect().await {
                                tracing::warn!("Failed to release {}: {}", device.name(), e);
                            }
                        }
                    }
                    return Err(Error::DevicesUnavailable(format!(
                        "no usable {} device (requested: {})",
                        platform,
                        platforms
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
            }
        }

        Ok(reserved
            .into_iter()
            .filter_map(|index| entries[index].device.clone())
            .collect())
    }

    async fn reserve_one(
        services: &Arc<HostServices>,
        registry: &DeviceRegistry,
        entries: &mut Vec<PoolEntry>,
        platform: Platform,
    ) -> Option<usize> {
        let mut expanded = false;
        loop {
            let candidate = entries
                .iter()
                .position(|e| e.platform == platform && !e.reserved && e.problem.is_none());

            let index = match candidate {
                Some(index) => index,
                // The host can run any number of local instances
                None if !expanded && platform == Platform::host() && registry.supports(platform) => {
                    expanded = true;
                    let name = format!(
                        "{}_{}",
                        HOST_DEVICE,
                        entries.iter().filter(|e| e.platform == platform).count() + 1
                    );
                    entries.push(PoolEntry::new(platform, &name, None));
                    entries.len() - 1
                }
                None => return None,
            };

            match Self::open(services, registry, &mut entries[index]).await {
                Ok(()) => {
                    entries[index].reserved = true;
                    return Some(index);
                }
                Err(e) => {
                    tracing::warn!(
                        "Device {} ({}) is unusable: {}",
                        entries[index].name,
                        platform,
                        e
                    );
                    entries[index].problem = Some(e.to_string());
                }
            }
        }
    }

    async fn open(
        services: &Arc<HostServices>,
        registry: &DeviceRegistry,
        entry: &mut PoolEntry,
    ) -> Result<()> {
        let device = match &entry.device {
            Some(device) => device.clone(),
            None => {
                let device = registry
                    .create_device(services, entry.platform, &entry.name, entry.param.as_deref())
                    .await?;
                entry.device = Some(device.clone());
                device
            }
        };

        let connected = async {
            device.connect().await?;
            if !device.is_on().await.unwrap_or(false) {
                device.power_on().await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = connected {
            entry.device = None;
            if let Err(release) = device.disconnect().await {
                tracing::warn!("Failed to release {}: {}", device.name(), release);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect and return devices to the pool. Every device is released;
    /// the first error is returned.
    pub async fn release(&self, devices: &[Arc<dyn Device>]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut first_error = None;

        for device in devices {
            if let Err(e) = device.disconnect().await {
                tracing::warn!("Failed to disconnect {}: {}", device.name(), e);
                first_error.get_or_insert(e);
            }
            if let Some(entry) = entries.iter_mut().find(|e| e.holds(device)) {
                entry.device = None;
                entry.reserved = false;
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Exclude a device from later reservations
    pub async fn mark_problem(&self, device: &str, reason: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.matches(device)) {
            tracing::warn!("Marking {} as a problem device: {}", device, reason);
            entry.problem = Some(reason.to_string());
        }
    }

    /// Disconnect everything still open
    pub async fn shutdown(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut first_error = None;
        for entry in entries.iter_mut() {
            entry.reserved = false;
            if let Some(device) = entry.device.take() {
                if let Err(e) = device.disconnect().await {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::factory::DeviceFactory;
    use crate::device::null::NullDevice;
    use crate::device::{AppConfig, AppInstall, AppInstance, DeviceState, LogicalDirectory, StateCell};
    use crate::process::scripted::{Scripted, ScriptedRunner};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;

    /// Device that refuses to connect
    struct Offline {
        name: String,
        state: StateCell,
    }

    #[async_trait]
    impl Device for Offline {
        fn name(&self) -> &str {
            &self.name
        }
        fn platform(&self) -> Platform {
            Platform::Android
        }
        fn state(&self) -> DeviceState {
            self.state.get()
        }
        fn local_cache_dir(&self) -> &Path {
            Path::new("/nonexistent")
        }
        async fn connect(&self) -> Result<()> {
            Err(Error::unreachable(&self.name, "device offline"))
        }
        async fn disconnect(&self) -> Result<()> {
            self.state.set(DeviceState::Disconnected);
            Ok(())
        }
        async fn install_application(&self, _config: &AppConfig) -> Result<AppInstall> {
            unreachable!()
        }
        async fn run(&self, _install: AppInstall) -> Result<Arc<dyn AppInstance>> {
            unreachable!()
        }
        fn platform_directory_mappings(&self) -> HashMap<LogicalDirectory, String> {
            HashMap::new()
        }
    }

    /// Android stand-in: names starting with "offline" refuse to connect
    struct FakeAndroid;

    #[async_trait]
    impl DeviceFactory for FakeAndroid {
        fn platform(&self) -> Platform {
            Platform::Android
        }

        async fn create_device(
            &self,
            _services: &Arc<HostServices>,
            name: &str,
            _param: Option<&str>,
        ) -> Result<Arc<dyn Device>> {
            if name.starts_with("offline") {
                Ok(Arc::new(Offline {
                    name: name.to_string(),
                    state: StateCell::default(),
                }))
            } else {
                Ok(Arc::new(NullDevice::new(name, Platform::Android)))
            }
        }
    }

    fn services(dir: &Path) -> Arc<HostServices> {
        let mut config = Config::default();
        config.android.key_dir = Some(dir.join(".android"));
        let runner = Arc::new(ScriptedRunner::new(|_| Scripted::ok("")));
        Arc::new(HostServices::new(config, runner, dir.to_path_buf()).unwrap())
    }

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::empty();
        registry.register(Arc::new(FakeAndroid));
        registry
    }

    #[tokio::test]
    async fn test_problem_device_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let registry = registry();
        let pool = DevicePool::empty();
        pool.add(Platform::Android, "offline-1", None).await;
        pool.add(Platform::Android, "R58M123456", None).await;

        let devices = pool
            .reserve(&services, &registry, &[Platform::Android])
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name(), "R58M123456");
        assert!(devices[0].is_connected());

        let status = pool.status().await;
        assert!(status[0].problem.is_some());
        assert!(status[1].reserved);

        pool.release(&devices).await.unwrap();
        assert_eq!(devices[0].state(), DeviceState::Disconnected);
        assert!(!pool.status().await[1].reserved);

        // Released devices can be reserved again, as a fresh device
        let again = pool
            .reserve(&services, &registry, &[Platform::Android])
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&again[0], &devices[0]));
        assert!(again[0].is_connected());
    }

    #[tokio::test]
    async fn test_reservation_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let registry = registry();
        let pool = DevicePool::empty();
        pool.add(Platform::Android, "R58M123456", None).await;

        let err = pool
            .reserve(&services, &registry, &[Platform::Android, Platform::Android])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DevicesUnavailable(_)));
        assert!(pool.status().await.iter().all(|s| !s.reserved));

        pool.reserve(&services, &registry, &[Platform::Android])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_marked_problem_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let registry = registry();
        let pool = DevicePool::empty();
        pool.add(Platform::Android, "R58M123456", None).await;

        let devices = pool
            .reserve(&services, &registry, &[Platform::Android])
            .await
            .unwrap();
        pool.mark_problem("R58M123456", "install failed").await;
        pool.release(&devices).await.unwrap();

        assert!(pool
            .reserve(&services, &registry, &[Platform::Android])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_host_device_expands() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let pool = DevicePool::from_config(&Config::default());
        let host = Platform::host();

        let devices = pool
            .reserve(&services, &DeviceRegistry::new(), &[host, host])
            .await
            .unwrap();
        assert_eq!(devices.len(), 2);
        assert_ne!(devices[0].name(), devices[1].name());
        pool.shutdown().await.unwrap();
    }
}
