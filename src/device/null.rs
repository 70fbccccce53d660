//! Placeholder device for roles that must not run anything

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    AppConfig, AppInstall, AppInstance, Device, DeviceState, LogicalDirectory, StateCell,
};
use crate::build::Platform;
use crate::common::Result;

/// Installs and runs nothing
pub struct NullDevice {
    name: String,
    platform: Platform,
    local_cache: PathBuf,
    state: StateCell,
}

impl NullDevice {
    pub fn new(name: &str, platform: Platform) -> Self {
        Self {
            name: name.to_string(),
            platform,
            local_cache: std::env::temp_dir().join(format!("devicelab-null-{}", name)),
            state: StateCell::default(),
        }
    }
}

#[async_trait]
impl Device for NullDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn state(&self) -> DeviceState {
        self.state.get()
    }

    fn local_cache_dir(&self) -> &Path {
        &self.local_cache
    }

    async fn connect(&self) -> Result<()> {
        if !self.is_connected() {
            self.state.set(DeviceState::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.set(DeviceState::Disconnected);
        Ok(())
    }

    async fn install_application(&self, config: &AppConfig) -> Result<AppInstall> {
        tracing::debug!("Null device {}: skipping install of {}", self.name, config.name);
        Ok(AppInstall {
            name: config.name.clone(),
            device_name: self.name.clone(),
            command_line: config.command_line.clone(),
            package_name: config.build.package_name.clone(),
            role: config.role,
            executable: None,
            working_dir: None,
        })
    }

    async fn run(&self, install: AppInstall) -> Result<Arc<dyn AppInstance>> {
        Ok(Arc::new(NullAppInstance {
            install,
            saved_dir: self.local_cache.join("Saved"),
            killed: AtomicBool::new(false),
        }))
    }

    fn platform_directory_mappings(&self) -> HashMap<LogicalDirectory, String> {
        HashMap::new()
    }
}

/// Alive until killed
pub struct NullAppInstance {
    install: AppInstall,
    saved_dir: PathBuf,
    killed: AtomicBool,
}

#[async_trait]
impl AppInstance for NullAppInstance {
    fn name(&self) -> &str {
        &self.install.name
    }

    fn device_name(&self) -> &str {
        &self.install.device_name
    }

    fn command_line(&self) -> &str {
        &self.install.command_line
    }

    async fn has_exited(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    async fn exit_code(&self) -> Option<i32> {
        self.killed.load(Ordering::SeqCst).then_some(0)
    }

    async fn std_out(&self) -> String {
        String::new()
    }

    async fn artifact_path(&self) -> PathBuf {
        self.saved_dir.clone()
    }

    async fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Build, BuildArtifact, BuildFlags, Configuration, RoleType};

    #[tokio::test]
    async fn test_alive_until_killed() {
        let device = NullDevice::new("null-0", Platform::Win64);
        device.connect().await.unwrap();

        let config = AppConfig {
            name: "Orion".into(),
            project: "Orion".into(),
            role: RoleType::Client,
            build: Build {
                platform: Platform::Win64,
                configuration: Configuration::Development,
                role: RoleType::Client,
                shared: true,
                flags: BuildFlags::LOOSE,
                package_name: "OrionGame/Binaries/Win64/OrionGame.exe".into(),
                artifact: BuildArtifact::default(),
                source_dir: PathBuf::new(),
                source: "StagedBuildSource",
            },
            command_line: "-nullrhi".into(),
            files_to_copy: Vec::new(),
        };
        let install = device.install_application(&config).await.unwrap();
        let instance = device.run(install).await.unwrap();

        assert!(!instance.has_exited().await);
        assert_eq!(instance.exit_code().await, None);
        instance.kill().await.unwrap();
        instance.kill().await.unwrap();
        assert!(instance.has_exited().await);
        assert!(instance.was_killed());
        assert_eq!(instance.exit_code().await, Some(0));
    }
}
