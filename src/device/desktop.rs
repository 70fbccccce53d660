//! The host machine as a device
//!
//! Staged builds are mirrored into a sandbox under the device cache and run
//! from there. The sandbox persists between sessions; the differential
//! deploy only copies files that changed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

use super::deploy::{deploy, DeployItem, DeployOutcome, LocalTransport};
use super::{
    directory_mappings, mappings_or_warn, resolve_files_to_copy, AppConfig, AppInstall,
    AppInstance, Device, DeviceState, LogicalDirectory, StateCell,
};
use crate::build::{BuildFlags, Platform};
use crate::common::{paths, split_command_line, Error, Result};
use crate::context::HostServices;
use crate::process::{ProcessHandle, SpawnOptions};

#[derive(Debug, Default)]
struct InstallState {
    mappings: HashMap<LogicalDirectory, String>,
    saved_dir: PathBuf,
}

/// The local machine
pub struct DesktopDevice {
    services: Arc<HostServices>,
    name: String,
    platform: Platform,
    local_cache: PathBuf,
    state: StateCell,
    install: Mutex<InstallState>,
}

impl DesktopDevice {
    pub fn new(services: &Arc<HostServices>, name: &str, platform: Platform) -> Result<Self> {
        if !platform.is_desktop() {
            return Err(Error::UnsupportedPlatform(platform));
        }
        let name = if name.is_empty() || name.eq_ignore_ascii_case("default") {
            "localhost"
        } else {
            name
        };
        let local_cache = services
            .cache_root
            .join(format!("DesktopDevice_{}", paths::sanitize_name(name)));
        std::fs::create_dir_all(&local_cache)?;

        Ok(Self {
            services: services.clone(),
            name: name.to_string(),
            platform,
            local_cache,
            state: StateCell::default(),
            install: Mutex::new(InstallState::default()),
        })
    }

    fn sandbox(&self) -> PathBuf {
        self.local_cache.join("Sandbox")
    }

    fn record_dir(&self) -> String {
        self.local_cache.join("Deps").to_string_lossy().into_owned()
    }

    /// Mirror the staged tree at `root` into the sandbox, skipping
    /// `skip` (relative). Returns how many files were copied.
    async fn sync_tree(&self, root: &Path, skip: &Path) -> Result<usize> {
        let sandbox = self.sandbox();
        let records = self.record_dir();
        let mut copied = 0;

        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            if relative.starts_with(skip) {
                continue;
            }
            let destination = sandbox.join(relative);
            let item = DeployItem::file(entry.path(), destination.to_string_lossy());
            if deploy(&LocalTransport, &records, &item, false).await? == DeployOutcome::Transferred
            {
                copied += 1;
            }
        }
        Ok(copied)
    }

    async fn install_inner(&self, config: &AppConfig) -> Result<AppInstall> {
        let build = &config.build;
        if build.platform != self.platform || !build.has_flags(BuildFlags::LOOSE) {
            return Err(Error::InvalidBuild(format!(
                "{} cannot be installed on {} device {}",
                build.describe(),
                self.platform,
                self.name
            )));
        }

        let project_dir = build
            .package_name
            .split('/')
            .next()
            .unwrap_or(config.project.as_str())
            .to_string();
        let saved_dir = self.sandbox().join(&project_dir).join("Saved");
        if saved_dir.exists() {
            std::fs::remove_dir_all(&saved_dir)?;
        }

        let skip = Path::new(&project_dir).join("Saved");
        let copied = self.sync_tree(&build.artifact.package_path, &skip).await?;
        tracing::info!(
            "{}: sandbox updated ({} files copied)",
            self.name,
            copied
        );

        let mappings = directory_mappings(&saved_dir.to_string_lossy());
        let records = self.record_dir();
        for (source, destination) in resolve_files_to_copy(&config.files_to_copy, &mappings) {
            deploy(&LocalTransport, &records, &DeployItem::file(source, destination), true)
                .await?;
        }

        {
            let mut install = self.install.lock().unwrap_or_else(|e| e.into_inner());
            install.mappings = mappings;
            install.saved_dir = saved_dir;
        }

        Ok(AppInstall {
            name: config.name.clone(),
            device_name: self.name.clone(),
            command_line: config.command_line.clone(),
            package_name: build.package_name.clone(),
            role: config.role,
            executable: Some(self.sandbox().join(&build.package_name)),
            working_dir: Some(self.sandbox()),
        })
    }

    async fn run_inner(&self, install: AppInstall) -> Result<Arc<dyn AppInstance>> {
        let executable = install
            .executable
            .clone()
            .ok_or_else(|| Error::invalid_state("run before install", "connected"))?;
        let saved_dir = self
            .install
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .saved_dir
            .clone();

        let args = split_command_line(&install.command_line);
        let options = SpawnOptions {
            working_dir: install.working_dir.clone(),
            env: Vec::new(),
        };

        tracing::info!("Launching {} on {}", executable.display(), self.name);
        tracing::debug!("  {}", install.command_line);
        let process = self
            .services
            .runner
            .spawn(&executable, &args, &options)
            .await
            .map_err(|e| Error::launch_failed(&self.name, &e.to_string()))?;

        Ok(Arc::new(DesktopAppInstance {
            install,
            process,
            was_killed: AtomicBool::new(false),
            saved_dir,
        }))
    }
}

#[async_trait]
impl Device for DesktopDevice {
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
        if self.state() == DeviceState::Disconnected {
            return Ok(());
        }
        self.state.set(DeviceState::Disconnected);

        match tokio::fs::remove_dir_all(&self.local_cache).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn install_application(&self, config: &AppConfig) -> Result<AppInstall> {
        self.state.begin("install")?;
        let result = self.install_inner(config).await;
        self.state.end();
        result
    }

    async fn run(&self, install: AppInstall) -> Result<Arc<dyn AppInstance>> {
        self.state.begin("run")?;
        let result = self.run_inner(install).await;
        self.state.end();
        result
    }

    fn platform_directory_mappings(&self) -> HashMap<LogicalDirectory, String> {
        let install = self.install.lock().unwrap_or_else(|e| e.into_inner());
        mappings_or_warn(&self.name, &install.mappings)
    }
}

/// A process on the host
pub struct DesktopAppInstance {
    install: AppInstall,
    process: Arc<dyn ProcessHandle>,
    was_killed: AtomicBool,
    saved_dir: PathBuf,
}

#[async_trait]
impl AppInstance for DesktopAppInstance {
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
        self.process.has_exited()
    }

    fn was_killed(&self) -> bool {
        self.was_killed.load(Ordering::SeqCst)
    }

    async fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    async fn std_out(&self) -> String {
        self.process.output()
    }

    async fn artifact_path(&self) -> PathBuf {
        self.saved_dir.clone()
    }

    async fn kill(&self) -> Result<()> {
        if !self.process.has_exited() {
            self.was_killed.store(true, Ordering::SeqCst);
            self.process.kill();
        }
        Ok(())
    }
}
