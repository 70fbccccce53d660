//! Device factories keyed by platform

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::android::AndroidDevice;
use super::desktop::DesktopDevice;
use super::ios::IosDevice;
use super::Device;
use crate::build::Platform;
use crate::common::{Error, Result};
use crate::context::HostServices;

/// Creates devices of one platform
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    fn platform(&self) -> Platform;

    /// Open the device called `name`; `param` is the pool entry's extra data
    async fn create_device(
        &self,
        services: &Arc<HostServices>,
        name: &str,
        param: Option<&str>,
    ) -> Result<Arc<dyn Device>>;
}

pub struct AndroidFactory;

#[async_trait]
impl DeviceFactory for AndroidFactory {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn create_device(
        &self,
        services: &Arc<HostServices>,
        name: &str,
        param: Option<&str>,
    ) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(AndroidDevice::create(services, name, param).await?))
    }
}

pub struct IosFactory;

#[async_trait]
impl DeviceFactory for IosFactory {
    fn platform(&self) -> Platform {
        Platform::IOS
    }

    async fn create_device(
        &self,
        services: &Arc<HostServices>,
        name: &str,
        _param: Option<&str>,
    ) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(IosDevice::create(services, name).await?))
    }
}

/// The host machine, for one desktop platform
pub struct DesktopFactory(pub Platform);

#[async_trait]
impl DeviceFactory for DesktopFactory {
    fn platform(&self) -> Platform {
        self.0
    }

    async fn create_device(
        &self,
        services: &Arc<HostServices>,
        name: &str,
        _param: Option<&str>,
    ) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(DesktopDevice::new(services, name, self.0)?))
    }
}

/// Factories for every platform this host can drive
pub struct DeviceRegistry {
    factories: HashMap<Platform, Arc<dyn DeviceFactory>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Registry with Android, iOS and the host's desktop platform
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(AndroidFactory));
        registry.register(Arc::new(IosFactory));
        registry.register(Arc::new(DesktopFactory(Platform::host())));
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add a factory, replacing any previous one for the same platform
    pub fn register(&mut self, factory: Arc<dyn DeviceFactory>) {
        self.factories.insert(factory.platform(), factory);
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.factories.contains_key(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.factories.keys().copied().collect();
        platforms.sort();
        platforms
    }

    pub async fn create_device(
        &self,
        services: &Arc<HostServices>,
        platform: Platform,
        name: &str,
        param: Option<&str>,
    ) -> Result<Arc<dyn Device>> {
        let factory = self
            .factories
            .get(&platform)
            .ok_or(Error::UnsupportedPlatform(platform))?;
        tracing::debug!("Creating {} device '{}'", platform, name);
        factory.create_device(services, name, param).await
    }
}
