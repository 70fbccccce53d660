//! iOS devices over ios-deploy
//!
//! The IPA is unpacked once into a shared host cache keyed by its hash. The
//! same hash is uploaded next to the app on the device, so a matching device
//! only gets its saved data cleared instead of a full reinstall.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::lldb::generate_crash_log;
use super::{
    directory_mappings, mappings_or_warn, resolve_files_to_copy, AppConfig, AppInstall,
    AppInstance, Device, DeviceState, LogicalDirectory, StateCell,
};
use crate::build::Platform;
use crate::common::{paths, Error, Result};
use crate::context::HostServices;
use crate::process::{describe_command, CommandOutput, ProcessHandle, SpawnOptions};

static DETECTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Found ([a-z0-9]{40})").expect("static regex"));

const DEVICE_HASH_PATH: &str = "/Documents/IPAHash.txt";
const HASH_FILE: &str = "IPAHash.txt";

/// Devices connected by this process, keyed by UUID
#[derive(Debug, Default)]
pub struct ConnectionRegistry(Mutex<HashSet<String>>);

impl ConnectionRegistry {
    /// Claim a device; fails if it is already claimed
    pub fn claim(&self, uuid: &str) -> Result<()> {
        let mut connected = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !connected.insert(uuid.to_string()) {
            return Err(Error::DevicesUnavailable(format!(
                "iOS device {} is already connected",
                uuid
            )));
        }
        Ok(())
    }

    pub fn release(&self, uuid: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid)
    }

    pub fn is_claimed(&self, uuid: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(uuid)
    }
}

/// Device UUIDs in `ios-deploy --detect` output
pub fn parse_detected(output: &str) -> Vec<String> {
    DETECTED
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect()
}

/// Runs ios-deploy against one device
#[derive(Clone)]
struct IosDeploy {
    services: Arc<HostServices>,
    /// `None` targets whichever device ios-deploy picks
    uuid: Option<String>,
}

impl IosDeploy {
    fn args(&self, args: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(uuid) = &self.uuid {
            full.push("--id".to_string());
            full.push(uuid.clone());
        }
        full.extend(args.iter().cloned());
        full
    }

    async fn run(&self, args: &[String], budget: Duration) -> Result<CommandOutput> {
        let program = self.services.config.ios_deploy_path();
        self.services.run_tool(&program, &self.args(args), budget).await
    }

    async fn spawn(&self, args: &[String]) -> Result<Arc<dyn ProcessHandle>> {
        let program = self.services.config.ios_deploy_path();
        let args = self.args(args);
        tracing::debug!("Starting: {}", describe_command(&program, &args));
        self.services
            .runner
            .spawn(&program, &args, &SpawnOptions::default())
            .await
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Unpack `ipa` into `cache` unless the cached copy has the same hash.
/// Returns the IPA hash and the `.app` bundle directory.
pub fn prepare_app_cache(ipa: &Path, cache: &Path) -> Result<(String, PathBuf)> {
    let hash = hash_file(ipa)?;
    let payload = cache.join("Payload");
    let hash_path = cache.join(HASH_FILE);

    let cached = if payload.exists() {
        std::fs::read_to_string(&hash_path).ok()
    } else {
        None
    };

    if cached.as_deref().map(str::trim) != Some(hash.as_str()) {
        tracing::info!("Unpacking {}", ipa.display());
        if payload.exists() {
            std::fs::remove_dir_all(&payload)?;
        }
        std::fs::create_dir_all(cache)?;

        let file = std::fs::File::open(ipa)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| Error::InvalidBuild(format!("{}: {}", ipa.display(), e)))?;
        archive
            .extract(cache)
            .map_err(|e| Error::InvalidBuild(format!("{}: {}", ipa.display(), e)))?;
        std::fs::write(&hash_path, &hash)?;
    } else {
        tracing::debug!("Using cached app bundle for {}", ipa.display());
    }

    let bundle = std::fs::read_dir(&payload)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.is_dir() && path.extension().map_or(false, |ext| ext == "app"))
        .ok_or_else(|| {
            Error::InvalidBuild(format!("{} has no Payload/*.app bundle", ipa.display()))
        })?;

    Ok((hash, bundle))
}

#[derive(Debug, Default)]
struct InstallState {
    mappings: HashMap<LogicalDirectory, String>,
    artifact_path: String,
    bundle: Option<PathBuf>,
}

/// An iOS device
pub struct IosDevice {
    services: Arc<HostServices>,
    tool: IosDeploy,
    uuid: String,
    local_cache: PathBuf,
    state: StateCell,
    install: Mutex<InstallState>,
}

impl IosDevice {
    /// Open a device by UUID, or the first one detected for `default`
    pub async fn create(services: &Arc<HostServices>, name: &str) -> Result<Self> {
        let detect = IosDeploy {
            services: services.clone(),
            uuid: None,
        };
        let out = detect
            .run(&["--detect".to_string()], services.config.command_budget())
            .await?;
        let detected = parse_detected(&out.output);

        let is_default = name.is_empty() || name.eq_ignore_ascii_case("default");
        let uuid = if is_default {
            detected
                .into_iter()
                .next()
                .ok_or_else(|| Error::DeviceNotFound("default".into()))?
        } else if detected.iter().any(|d| d == name) {
            name.to_string()
        } else {
            return Err(Error::DeviceNotFound(name.to_string()));
        };

        let local_cache = services
            .cache_root
            .join(format!("IOSDevice_{}", paths::sanitize_name(&uuid)));
        if local_cache.exists() {
            std::fs::remove_dir_all(&local_cache)?;
        }
        std::fs::create_dir_all(&local_cache)?;

        tracing::info!("Opened iOS device {}", uuid);
        Ok(Self {
            tool: IosDeploy {
                services: services.clone(),
                uuid: if is_default { None } else { Some(uuid.clone()) },
            },
            services: services.clone(),
            uuid,
            local_cache,
            state: StateCell::default(),
            install: Mutex::new(InstallState::default()),
        })
    }

    fn app_cache(&self) -> PathBuf {
        self.services.cache_root.join("ios")
    }

    async fn deployed_hash_matches(&self, bundle_id: &str, hash: &str) -> bool {
        let local = self.local_cache.to_string_lossy().into_owned();
        let args = vec![
            "--bundle_id".to_string(),
            bundle_id.to_string(),
            format!("--download={}", DEVICE_HASH_PATH),
            "--to".to_string(),
            local,
        ];
        match self.tool.run(&args, self.services.config.command_budget()).await {
            Ok(out) if out.success() => {}
            _ => return false,
        }

        let downloaded = self.local_cache.join(DEVICE_HASH_PATH.trim_start_matches('/'));
        std::fs::read_to_string(downloaded)
            .map(|stored| stored.trim() == hash)
            .unwrap_or(false)
    }

    async fn install_inner(&self, config: &AppConfig) -> Result<AppInstall> {
        let build = &config.build;
        if build.platform != Platform::IOS {
            return Err(Error::InvalidBuild(format!(
                "{} cannot be installed on iOS device {}",
                build.describe(),
                self.uuid
            )));
        }
        let bundle_id = build.package_name.clone();
        let artifact_path = format!("/Documents/{}/Saved", config.project);
        let budget = self.services.config.command_budget();

        let (hash, bundle) = {
            let _guard = self.services.app_cache_lock.lock().await;
            let ipa = build.artifact.package_path.clone();
            let cache = self.app_cache();
            tokio::task::spawn_blocking(move || prepare_app_cache(&ipa, &cache))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??
        };

        if self.deployed_hash_matches(&bundle_id, &hash).await {
            tracing::info!("{} already on {}, clearing saved data", bundle_id, self.uuid);
            let args = vec![
                "--bundle_id".to_string(),
                bundle_id.clone(),
                "--rm_r".to_string(),
                artifact_path.clone(),
            ];
            let out = self.tool.run(&args, budget).await?;
            if !out.success() {
                tracing::warn!("Failed to clear {}: {}", artifact_path, out.output.trim());
            }
        } else {
            tracing::info!("Installing {} on {}", bundle.display(), self.uuid);
            let args = vec![
                "--uninstall".to_string(),
                "-b".to_string(),
                bundle.to_string_lossy().into_owned(),
            ];
            let source = bundle.to_string_lossy().into_owned();
            let out = self
                .tool
                .run(&args, self.services.config.install_budget())
                .await?;
            if !out.success() {
                return Err(Error::transfer(&self.uuid, &source, &bundle_id, &out.output));
            }
        }

        let _guard = self.services.main_lock.lock().await;
        let staging = self.services.cache_root.join("iOSAppInstall");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let mappings = directory_mappings(&staging.to_string_lossy());
        for (source, destination) in resolve_files_to_copy(&config.files_to_copy, &mappings) {
            let destination = PathBuf::from(destination);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &destination)?;
        }

        let uploads = [
            (staging.to_string_lossy().into_owned(), artifact_path.clone()),
            (
                self.app_cache().join(HASH_FILE).to_string_lossy().into_owned(),
                DEVICE_HASH_PATH.to_string(),
            ),
        ];
        for (local, remote) in uploads {
            let args = vec![
                "--bundle_id".to_string(),
                bundle_id.clone(),
                format!("--upload={}", local),
                "--to".to_string(),
                remote.clone(),
            ];
            let out = self.tool.run(&args, budget).await?;
            if !out.success() {
                return Err(Error::transfer(&self.uuid, &local, &remote, &out.output));
            }
        }

        {
            let mut install = self.install.lock().unwrap_or_else(|e| e.into_inner());
            install.mappings = mappings;
            install.artifact_path = artifact_path;
            install.bundle = Some(bundle);
        }

        Ok(AppInstall {
            name: config.name.clone(),
            device_name: self.uuid.clone(),
            command_line: config.command_line.clone(),
            package_name: bundle_id,
            role: config.role,
            executable: None,
            working_dir: None,
        })
    }

    async fn run_inner(&self, install: AppInstall) -> Result<Arc<dyn AppInstance>> {
        let (bundle, artifact_path) = {
            let state = self.install.lock().unwrap_or_else(|e| e.into_inner());
            (state.bundle.clone(), state.artifact_path.clone())
        };
        let bundle = bundle.ok_or_else(|| Error::invalid_state("run before install", "connected"))?;

        tracing::info!("Launching {} on {}", install.package_name, self.uuid);
        tracing::debug!("  {}", install.command_line);

        let args = vec![
            "--noinstall".to_string(),
            "-I".to_string(),
            "-b".to_string(),
            bundle.to_string_lossy().into_owned(),
            "--args".to_string(),
            install.command_line.trim().replace('"', "\\\""),
        ];
        let process = self.tool.spawn(&args).await?;

        tokio::time::sleep(Duration::from_secs(
            self.services.config.timeouts.launch_settle_secs,
        ))
        .await;

        if process.has_exited() {
            return Err(Error::launch_failed(&self.uuid, &process.output()));
        }

        Ok(Arc::new(IosAppInstance {
            tool: self.tool.clone(),
            install,
            process,
            was_killed: AtomicBool::new(false),
            artifact_path,
            local_cache: self.local_cache.clone(),
            artifacts: OnceCell::new(),
        }))
    }
}

#[async_trait]
impl Device for IosDevice {
    fn name(&self) -> &str {
        &self.uuid
    }

    fn platform(&self) -> Platform {
        Platform::IOS
    }

    fn state(&self) -> DeviceState {
        self.state.get()
    }

    fn local_cache_dir(&self) -> &Path {
        &self.local_cache
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.services.main_lock.lock().await;
        self.services.ios_connections.claim(&self.uuid)?;
        self.state.set(DeviceState::Connected);
        tracing::info!("Connected to {}", self.uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.state() == DeviceState::Disconnected {
            return Ok(());
        }
        {
            let _guard = self.services.main_lock.lock().await;
            self.services.ios_connections.release(&self.uuid);
        }
        self.state.set(DeviceState::Disconnected);

        if self.local_cache.exists() {
            std::fs::remove_dir_all(&self.local_cache)?;
        }
        tracing::info!("Disconnected from {}", self.uuid);
        Ok(())
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
        mappings_or_warn(&self.uuid, &install.mappings)
    }
}

/// An application running under ios-deploy's debugger
pub struct IosAppInstance {
    tool: IosDeploy,
    install: AppInstall,
    process: Arc<dyn ProcessHandle>,
    was_killed: AtomicBool,
    /// Saved-data directory on the device
    artifact_path: String,
    local_cache: PathBuf,
    artifacts: OnceCell<()>,
}

impl IosAppInstance {
    fn local_artifacts(&self) -> PathBuf {
        self.local_cache
            .join(self.artifact_path.trim_start_matches('/'))
    }

    async fn download_artifacts(&self) {
        let args = vec![
            "--bundle_id".to_string(),
            self.install.package_name.clone(),
            format!("--download={}", self.artifact_path),
            "--to".to_string(),
            self.local_cache.to_string_lossy().into_owned(),
        ];
        let budget = self.tool.services.config.install_budget();
        match self.tool.run(&args, budget).await {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!("Failed to download artifacts: {}", out.output.trim()),
            Err(e) => tracing::warn!("Failed to download artifacts: {}", e),
        }
    }
}

#[async_trait]
impl AppInstance for IosAppInstance {
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
        let output = self.process.output();
        if !self.process.has_exited() {
            return output;
        }
        match generate_crash_log(&output) {
            Some(crash) => format!("{}\n{}", output, crash),
            None => output,
        }
    }

    async fn artifact_path(&self) -> PathBuf {
        if self.process.has_exited() {
            self.artifacts
                .get_or_init(|| self.download_artifacts())
                .await;
        }
        self.local_artifacts()
    }

    async fn kill(&self) -> Result<()> {
        if !self.process.has_exited() {
            self.was_killed.store(true, Ordering::SeqCst);
            self.process.kill();
        }
        Ok(())
    }
}
