//! Fake devices and builds for exercising sessions

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::instance::fake::FakeInstance;
use crate::build::{
    Build, BuildArtifact, BuildCatalog, BuildFlags, BuildSource, Configuration, Platform, RoleType,
};
use crate::common::config::{Config, DeviceEntry};
use crate::common::{Error, Result};
use crate::context::{HostServices, RunContext};
use crate::device::factory::DeviceFactory;
use crate::device::{
    AppConfig, AppInstall, AppInstance, Device, DeviceRegistry, DeviceState, LogicalDirectory,
    StateCell,
};
use crate::process::scripted::{Scripted, ScriptedRunner};

/// Shared record of what the fake devices did
#[derive(Default)]
pub struct Lab {
    pub fail_run: HashSet<String>,
    pub installs: Mutex<Vec<(String, String)>>,
    pub instances: Mutex<Vec<Arc<FakeInstance>>>,
}

pub struct LabDevice {
    name: String,
    lab: Arc<Lab>,
    cache: PathBuf,
    state: StateCell,
}

#[async_trait]
impl Device for LabDevice {
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
        &self.cache
    }
    async fn connect(&self) -> Result<()> {
        self.state.set(DeviceState::Connected);
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        self.state.set(DeviceState::Disconnected);
        Ok(())
    }
    async fn install_application(&self, config: &AppConfig) -> Result<AppInstall> {
        self.lab
            .installs
            .lock()
            .unwrap()
            .push((self.name.clone(), config.command_line.clone()));
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
    async fn run(&self, _install: AppInstall) -> Result<Arc<dyn AppInstance>> {
        if self.lab.fail_run.contains(&self.name) {
            return Err(Error::launch_failed(&self.name, "activity never started"));
        }
        let instance = Arc::new(FakeInstance::new(&self.name));
        self.lab.instances.lock().unwrap().push(instance.clone());
        Ok(instance)
    }
    fn platform_directory_mappings(&self) -> HashMap<LogicalDirectory, String> {
        HashMap::new()
    }
}

pub struct LabFactory(pub Arc<Lab>);

#[async_trait]
impl DeviceFactory for LabFactory {
    fn platform(&self) -> Platform {
        Platform::Android
    }
    async fn create_device(
        &self,
        services: &Arc<HostServices>,
        name: &str,
        _param: Option<&str>,
    ) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(LabDevice {
            name: name.to_string(),
            lab: self.0.clone(),
            cache: services.cache_root.join(name),
            state: StateCell::default(),
        }))
    }
}

pub struct ApkSource;

impl BuildSource for ApkSource {
    fn build_name(&self) -> &'static str {
        "ApkSource"
    }
    fn can_support_platform(&self, platform: Platform) -> bool {
        platform == Platform::Android
    }
    fn get_builds_at_path(&self, _project: &str, path: &Path, _max: usize) -> Vec<Build> {
        vec![Build {
            platform: Platform::Android,
            configuration: Configuration::Test,
            role: RoleType::Client,
            shared: true,
            flags: BuildFlags::PACKAGED,
            package_name: "com.epicgames.orion".into(),
            artifact: BuildArtifact::default(),
            source_dir: path.to_path_buf(),
            source: "ApkSource",
        }]
    }
}

pub fn context(dir: &Path, devices: &[&str], lab: Arc<Lab>) -> Arc<RunContext> {
    let mut config = Config::default();
    config.android.key_dir = Some(dir.join(".android"));
    config.session.common_args = "-unattended".into();
    config.devices = devices
        .iter()
        .map(|name| DeviceEntry {
            platform: Platform::Android,
            name: name.to_string(),
            param: None,
        })
        .collect();
    let runner = Arc::new(ScriptedRunner::new(|_| Scripted::ok("")));
    let mut context = RunContext::with_runner(config, runner, dir.join("cache")).unwrap();

    let mut registry = DeviceRegistry::empty();
    registry.register(Arc::new(LabFactory(lab)));
    context.registry = registry;
    let mut catalog = BuildCatalog::empty();
    catalog.register(Arc::new(ApkSource));
    context.catalog = catalog;
    Arc::new(context)
}
