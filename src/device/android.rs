//! Android devices over adb
//!
//! Every operation is an `adb -s <serial> ...` command. Installs are
//! differential: the APK and each data file carry a dependency record on the
//! device and are only re-sent when they changed.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::credentials::AdbKeys;
use super::deploy::{deploy, DeployItem, DeployKind, DeployTransport};
use super::throttle::{LivenessProbe, LogSource, ThrottledLiveness, ThrottledLog};
use super::{
    directory_mappings, mappings_or_warn, resolve_files_to_copy, AppConfig, AppInstall,
    AppInstance, Device, DeviceState, LogicalDirectory, StateCell,
};
use crate::build::{BuildFlags, Platform};
use crate::common::{normalize_newlines, paths, Error, Result};
use crate::context::HostServices;
use crate::process::{describe_command, CommandOutput, ProcessHandle, SpawnOptions};

static DEVICE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([\d\w\.:\-]{6,32})\s+(\w+)").expect("static regex"));
static VERSION_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"versionCode=([\d\.]+)\s").expect("static regex"));
static OBB_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"main\.(\d+)\.com.*\.obb").expect("static regex"));
static STORAGE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)%STORAGE%").expect("static regex"));

const DEFAULT_STORAGE: &str = "/sdcard";
const NETWORK_PORT: &str = ":5555";

/// One line of `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    pub serial: String,
    pub authorized: bool,
}

/// Parse the output of `adb devices`
pub fn parse_device_list(output: &str) -> Vec<AdbDevice> {
    DEVICE_LINE
        .captures_iter(output)
        .map(|c| AdbDevice {
            serial: c[1].to_string(),
            authorized: !c[2].contains("unauthorized"),
        })
        .collect()
}

/// Replace the version in an OBB file name with the installed version code
pub fn rename_obb(destination: &str, version_code: &str) -> String {
    match OBB_VERSION.captures(destination).and_then(|c| c.get(1)) {
        Some(m) => format!(
            "{}{}{}",
            &destination[..m.start()],
            version_code,
            &destination[m.end()..]
        ),
        None => destination.to_string(),
    }
}

/// Runs adb, optionally bound to one device
#[derive(Clone)]
pub struct AdbClient {
    services: Arc<HostServices>,
    serial: Option<String>,
}

impl AdbClient {
    /// Client for commands that are not bound to a device
    pub fn host(services: Arc<HostServices>) -> Self {
        Self {
            services,
            serial: None,
        }
    }

    pub fn device(services: Arc<HostServices>, serial: &str) -> Self {
        Self {
            services,
            serial: Some(serial.to_string()),
        }
    }

    pub fn serial(&self) -> &str {
        self.serial.as_deref().unwrap_or("")
    }

    fn args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    pub async fn adb_with_budget(&self, args: &[&str], budget: Duration) -> Result<CommandOutput> {
        let program = self.services.config.adb_path();
        self.services.run_tool(&program, &self.args(args), budget).await
    }

    pub async fn adb(&self, args: &[&str]) -> Result<CommandOutput> {
        self.adb_with_budget(args, self.services.config.command_budget())
            .await
    }

    /// Run a device shell command
    pub async fn shell(&self, command: &str) -> Result<CommandOutput> {
        self.adb(&["shell", command]).await
    }

    /// Run a device shell command that must succeed; returns its output
    pub async fn shell_checked(&self, command: &str) -> Result<String> {
        let out = self.shell(command).await?;
        let description = format!("adb -s {} shell {}", self.serial(), command);
        Ok(out.check(&description)?.output)
    }

    /// Start a command without waiting for it
    pub async fn spawn(&self, args: &[&str]) -> Result<Arc<dyn ProcessHandle>> {
        let program = self.services.config.adb_path();
        let args = self.args(args);
        tracing::debug!("Starting: {}", describe_command(&program, &args));
        self.services
            .runner
            .spawn(&program, &args, &SpawnOptions::default())
            .await
    }
}

/// Devices currently visible to the adb server
pub async fn list_devices(services: &Arc<HostServices>) -> Result<Vec<AdbDevice>> {
    let out = AdbClient::host(services.clone())
        .adb(&["devices"])
        .await?
        .check("adb devices")?;
    Ok(parse_device_list(&out.output))
}

/// Device parameter of an Android pool entry
#[derive(Debug, Default, Deserialize)]
struct AndroidDeviceData {
    #[serde(rename = "publicKey")]
    public_key: Option<String>,
    #[serde(rename = "privateKey")]
    private_key: Option<String>,
}

fn parse_device_keys(param: Option<&str>) -> Result<Option<AdbKeys>> {
    let Some(param) = param.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    let data: AndroidDeviceData = serde_json::from_str(param)
        .map_err(|e| Error::Config(format!("Invalid Android device data: {}", e)))?;
    match (data.public_key, data.private_key) {
        (None, None) => Ok(None),
        (Some(public_key), Some(private_key)) => Ok(Some(AdbKeys {
            public_key,
            private_key,
        })),
        _ => Err(Error::Credentials("Invalid key in device data".into())),
    }
}

#[derive(Debug, Default)]
struct InstallState {
    mappings: HashMap<LogicalDirectory, String>,
    artifact_dir: String,
    command_line_path: String,
}

/// An Android device reached through adb
pub struct AndroidDevice {
    services: Arc<HostServices>,
    adb: AdbClient,
    serial: String,
    is_network: bool,
    local_cache: PathBuf,
    state: StateCell,
    lease_held: AtomicBool,
    install: Mutex<InstallState>,
}

impl AndroidDevice {
    /// Open a device by serial, or the first authorized one for `default`
    ///
    /// Takes a lease on the shared adb credentials, released by
    /// [`Device::disconnect`].
    pub async fn create(
        services: &Arc<HostServices>,
        name: &str,
        param: Option<&str>,
    ) -> Result<Self> {
        let keys = parse_device_keys(param)?;
        services.acquire_adb_credentials(keys.as_ref()).await?;

        match Self::resolve_serial(services, name).await {
            Ok((serial, is_network)) => {
                let local_cache = services
                    .cache_root
                    .join(format!("AndroidDevice_{}", paths::sanitize_name(&serial)));
                if let Err(e) = std::fs::create_dir_all(&local_cache) {
                    services.release_adb_credentials().await?;
                    return Err(e.into());
                }
                tracing::info!("Opened Android device {}", serial);
                Ok(Self {
                    adb: AdbClient::device(services.clone(), &serial),
                    services: services.clone(),
                    serial,
                    is_network,
                    local_cache,
                    state: StateCell::default(),
                    lease_held: AtomicBool::new(true),
                    install: Mutex::new(InstallState::default()),
                })
            }
            Err(e) => {
                if let Err(release) = services.release_adb_credentials().await {
                    tracing::warn!("Failed to release adb credentials: {}", release);
                }
                Err(e)
            }
        }
    }

    async fn resolve_serial(services: &Arc<HostServices>, name: &str) -> Result<(String, bool)> {
        let mut devices = list_devices(services).await?;

        if name.is_empty() || name.eq_ignore_ascii_case("default") {
            return devices
                .into_iter()
                .find(|d| d.authorized)
                .map(|d| {
                    let is_network = d.serial.contains(':');
                    (d.serial, is_network)
                })
                .ok_or_else(|| Error::DeviceNotFound("default".into()));
        }

        let mut serial = name.to_string();
        if !devices.iter().any(|d| d.serial == serial) {
            if !serial.contains(':') {
                serial.push_str(NETWORK_PORT);
            }

            let _guard = services.main_lock.lock().await;
            tracing::info!("Connecting to network device {}", serial);
            let out = AdbClient::host(services.clone())
                .adb(&["connect", &serial])
                .await?;
            if !out.success() {
                tracing::warn!("adb connect {} failed: {}", serial, out.output.trim());
            }
            tokio::time::sleep(Duration::from_secs(
                services.config.timeouts.adb_settle_secs,
            ))
            .await;
            devices = list_devices(services).await?;
        }

        match devices.iter().find(|d| d.serial == serial) {
            None => Err(Error::DeviceNotFound(serial)),
            Some(d) if !d.authorized => Err(Error::DeviceUnauthorized(serial)),
            Some(_) => {
                let is_network = serial.contains(':');
                Ok((serial, is_network))
            }
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    async fn external_storage(&self) -> String {
        match self.adb.shell("echo $EXTERNAL_STORAGE").await {
            Ok(out) if out.success() && !out.output.trim().is_empty() => {
                out.output.trim().to_string()
            }
            _ => DEFAULT_STORAGE.to_string(),
        }
    }

    async fn installed_version(&self, package: &str) -> Option<String> {
        let out = self
            .adb
            .shell(&format!("dumpsys package {} | grep versionCode", package))
            .await
            .ok()?;
        VERSION_CODE
            .captures(&out.output)
            .map(|c| c[1].to_string())
    }

    async fn force_stop(&self, package: &str) -> Result<()> {
        tracing::debug!("{}: stopping {}", self.serial, package);
        self.adb.shell(&format!("am force-stop {}", package)).await?;
        Ok(())
    }

    async fn install_inner(&self, config: &AppConfig) -> Result<AppInstall> {
        let build = &config.build;
        if build.platform != Platform::Android {
            return Err(Error::InvalidBuild(format!(
                "{} cannot be installed on Android device {}",
                build.describe(),
                self.serial
            )));
        }

        let package = build.package_name.as_str();
        let android = &self.services.config.android;

        self.force_stop(package).await?;

        let storage = self.external_storage().await;
        let remote_dir = if build
            .flags
            .intersects(BuildFlags::BULK | BuildFlags::CAN_REPLACE_EXECUTABLE)
        {
            format!("{}/{}/{}", storage, android.remote_root, config.project)
        } else {
            format!(
                "{}/Android/data/{}/files/{}/{}",
                storage, package, android.remote_root, config.project
            )
        };
        let artifact_dir = format!("{}/{}/Saved", remote_dir, config.project);
        let obb_dir = format!("{}/obb/{}", storage, package);
        let command_line_path = format!("{}/UE4CommandLine.txt", remote_dir);

        self.adb.shell(&format!("rm -r {}", artifact_dir)).await?;

        let mappings = directory_mappings(&artifact_dir);
        {
            let mut install = self.install.lock().unwrap_or_else(|e| e.into_inner());
            install.mappings = mappings.clone();
            install.artifact_dir = artifact_dir.clone();
            install.command_line_path = command_line_path.clone();
        }

        if android.clean_device {
            tracing::info!("{}: cleaning previous install of {}", self.serial, package);
            self.adb.adb(&["uninstall", package]).await?;
            self.adb.shell(&format!("rm -r {}", remote_dir)).await?;
            self.adb.shell(&format!("rm -r {}", obb_dir)).await?;
        }
        self.adb.shell(&format!("mkdir -p {}/", remote_dir)).await?;

        let transport = AdbTransport {
            adb: self.adb.clone(),
            budget: self.services.config.install_budget(),
        };

        let mut items: Vec<DeployItem> = resolve_files_to_copy(&config.files_to_copy, &mappings)
            .into_iter()
            .map(|(source, destination)| DeployItem::file(source, destination))
            .collect();

        if android.skip_deploy {
            tracing::info!("Skipping install of {} (skip_deploy)", package);
        } else {
            deploy(
                &transport,
                &android.dependency_dir,
                &DeployItem::package(&build.artifact.package_path, package),
                false,
            )
            .await?;

            let version_code = self.installed_version(package).await;
            if version_code.is_none() {
                tracing::warn!("{}: could not read versionCode of {}", self.serial, package);
            }

            for (source, destination) in &build.artifact.files {
                let mut destination = STORAGE_TOKEN
                    .replace_all(destination, storage.as_str())
                    .into_owned();
                if let Some(code) = &version_code {
                    destination = rename_obb(&destination, code);
                }
                items.push(DeployItem::file(source, destination));
            }

            self.remove_stale_obbs(&obb_dir, &items).await?;
        }

        for item in &items {
            deploy(&transport, &android.dependency_dir, item, false).await?;
        }

        self.push_command_line(&config.command_line, &command_line_path)
            .await?;

        Ok(AppInstall {
            name: config.name.clone(),
            device_name: self.serial.clone(),
            command_line: config.command_line.clone(),
            package_name: package.to_string(),
            role: config.role,
            executable: None,
            working_dir: None,
        })
    }

    async fn remove_stale_obbs(&self, obb_dir: &str, items: &[DeployItem]) -> Result<()> {
        let out = self.adb.shell(&format!("ls {}", obb_dir)).await?;
        if !out.success() {
            return Ok(());
        }

        let wanted: HashSet<&str> = items
            .iter()
            .filter_map(|item| item.destination.rsplit('/').next())
            .collect();

        for name in normalize_newlines(&out.output).lines().map(str::trim) {
            if name.is_empty() || name.starts_with('.') || wanted.contains(name) {
                continue;
            }
            tracing::info!("{}: removing stale file {}/{}", self.serial, obb_dir, name);
            self.adb
                .shell(&format!("rm -f {}/{}", obb_dir, name))
                .await?;
        }
        Ok(())
    }

    async fn push_command_line(&self, command_line: &str, remote: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        // Padded; some adb versions truncate the last byte of a push
        write!(file, "{}    ", command_line)?;
        file.flush()?;

        let local = file.path().to_string_lossy().into_owned();
        let out = self.adb.adb(&["push", &local, remote]).await?;
        if !out.success() {
            return Err(Error::transfer(&self.serial, &local, remote, &out.output));
        }
        Ok(())
    }
}

#[async_trait]
impl Device for AndroidDevice {
    fn name(&self) -> &str {
        &self.serial
    }

    fn platform(&self) -> Platform {
        Platform::Android
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
        self.adb.shell("svc power stayon usb").await?;
        self.state.set(DeviceState::Connected);
        tracing::info!("Connected to {}", self.serial);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.state() == DeviceState::Disconnected {
            return Ok(());
        }

        let mut first_error = None;

        if self.is_connected() {
            if let Err(e) = self.adb.shell("svc power stayon false").await {
                first_error.get_or_insert(e);
            }
        }

        if self.is_network {
            let _guard = self.services.main_lock.lock().await;
            let host = AdbClient::host(self.services.clone());
            if let Err(e) = host.adb(&["disconnect", &self.serial]).await {
                first_error.get_or_insert(e);
            }
        }

        if self.local_cache.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.local_cache) {
                first_error.get_or_insert(e.into());
            }
        }

        if self.lease_held.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.services.release_adb_credentials().await {
                first_error.get_or_insert(e);
            }
        }

        self.state.set(DeviceState::Disconnected);
        tracing::info!("Disconnected from {}", self.serial);
        first_error.map_or(Ok(()), Err)
    }

    async fn is_on(&self) -> Result<bool> {
        let power = self.adb.shell_checked("dumpsys power").await?;
        Ok(power.contains("mHoldingDisplaySuspendBlocker=true")
            && power.contains("mHoldingWakeLockSuspendBlocker=true"))
    }

    async fn power_on(&self) -> Result<()> {
        tracing::debug!("{}: waking device", self.serial);
        self.adb
            .shell("input keyevent KEYCODE_WAKEUP && input keyevent KEYCODE_MENU")
            .await?;
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        self.adb.shell("input keyevent KEYCODE_SLEEP").await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.adb
            .adb_with_budget(&["reboot"], self.services.config.install_budget())
            .await?;
        self.adb
            .adb_with_budget(&["wait-for-device"], self.services.config.install_budget())
            .await?;
        Ok(())
    }

    async fn install_application(&self, config: &AppConfig) -> Result<AppInstall> {
        self.state.begin("install")?;
        tracing::info!("Installing {} on {}", config.build.describe(), self.serial);
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
        mappings_or_warn(&self.serial, &install.mappings)
    }
}

impl AndroidDevice {
    async fn run_inner(&self, install: AppInstall) -> Result<Arc<dyn AppInstance>> {
        let (artifact_dir, command_line_path) = {
            let state = self.install.lock().unwrap_or_else(|e| e.into_inner());
            (state.artifact_dir.clone(), state.command_line_path.clone())
        };
        if artifact_dir.is_empty() {
            return Err(Error::invalid_state("run before install", "connected"));
        }

        let package = install.package_name.clone();
        let activity = &self.services.config.android.launch_activity;

        self.power_on().await?;
        self.force_stop(&package).await?;

        tracing::info!("Launching {}/{} on {}", package, activity, self.serial);
        tracing::debug!("  {}", install.command_line);

        self.adb.adb(&["logcat", "--clear"]).await?;
        let log_path = format!("{}/Logs/{}.log", artifact_dir, install.name);
        self.adb.shell(&format!("rm -f {}", log_path)).await?;

        let component = format!("{}/{}", package, activity);
        let launch = self
            .adb
            .spawn(&["shell", "am", "start", "-W", "-S", "-n", &component])
            .await?;

        let config = &self.services.config;
        Ok(Arc::new(AndroidAppInstance {
            liveness: ThrottledLiveness::new(
                ActivityProbe {
                    adb: self.adb.clone(),
                    package: package.clone(),
                },
                config.liveness_interval(),
            ),
            log: ThrottledLog::new(
                DeviceLogFile {
                    adb: self.adb.clone(),
                    path: log_path,
                },
                config.log_interval(),
            ),
            adb: self.adb.clone(),
            install,
            launch,
            was_killed: AtomicBool::new(false),
            artifact_dir,
            command_line_path,
            local_cache: self.local_cache.clone(),
            artifacts: OnceCell::new(),
        }))
    }
}

/// Differential deployment over adb
struct AdbTransport {
    adb: AdbClient,
    budget: Duration,
}

fn non_empty_success(out: CommandOutput) -> Option<String> {
    if out.success() && !out.output.trim().is_empty() {
        Some(out.output.trim().to_string())
    } else {
        None
    }
}

#[async_trait]
impl DeployTransport for AdbTransport {
    async fn remote_file_info(&self, item: &DeployItem) -> Result<Option<String>> {
        let command = match &item.kind {
            DeployKind::Package { package_name } => {
                format!("dumpsys package {} | grep lastUpdateTime", package_name)
            }
            DeployKind::File => format!("ls -l {}", item.destination),
        };
        Ok(non_empty_success(self.adb.shell(&command).await?))
    }

    async fn read_record(&self, record_path: &str) -> Result<Option<String>> {
        Ok(non_empty_success(
            self.adb.shell(&format!("cat {}", record_path)).await?,
        ))
    }

    async fn write_record(&self, record_path: &str, content: &str) -> Result<()> {
        if let Some((dir, _)) = record_path.rsplit_once('/') {
            self.adb.shell(&format!("mkdir -p {}", dir)).await?;
        }
        self.adb
            .shell_checked(&format!("echo \"{}\" > {}", content, record_path))
            .await?;
        Ok(())
    }

    async fn transfer(&self, item: &DeployItem) -> Result<()> {
        let source = item.source.to_string_lossy().into_owned();
        let out = match &item.kind {
            DeployKind::Package { package_name } => {
                let uninstall = self
                    .adb
                    .adb_with_budget(&["uninstall", package_name], self.budget)
                    .await?;
                if !uninstall.success() {
                    tracing::debug!("uninstall {} failed: {}", package_name, uninstall.output.trim());
                }
                self.adb
                    .adb_with_budget(&["install", "-r", &source], self.budget)
                    .await?
            }
            DeployKind::File => {
                self.adb
                    .adb_with_budget(&["push", &source, &item.destination], self.budget)
                    .await?
            }
        };

        // adb install reports some failures with exit code 0
        if !out.success() || out.output.contains("Failure [") {
            return Err(Error::transfer(
                self.adb.serial(),
                &source,
                &item.destination,
                &out.output,
            ));
        }
        Ok(())
    }
}

/// Reports whether an activity of the package is resumed
struct ActivityProbe {
    adb: AdbClient,
    package: String,
}

#[async_trait]
impl LivenessProbe for ActivityProbe {
    async fn is_alive(&self) -> Result<bool> {
        let activity = self
            .adb
            .shell_checked(&format!("dumpsys activity -p {} a", self.package))
            .await?;
        Ok(activity.contains(&self.package) && activity.contains("mResumedActivity"))
    }
}

/// The application's own log file on the device
struct DeviceLogFile {
    adb: AdbClient,
    path: String,
}

#[async_trait]
impl LogSource for DeviceLogFile {
    async fn fetch(&self) -> Result<String> {
        let log = self.adb.shell_checked(&format!("cat {}", self.path)).await?;
        Ok(normalize_newlines(&log))
    }
}

/// A running Android application
pub struct AndroidAppInstance {
    install: AppInstall,
    adb: AdbClient,
    launch: Arc<dyn ProcessHandle>,
    liveness: ThrottledLiveness<ActivityProbe>,
    log: ThrottledLog<DeviceLogFile>,
    was_killed: AtomicBool,
    artifact_dir: String,
    command_line_path: String,
    local_cache: PathBuf,
    artifacts: OnceCell<()>,
}

impl AndroidAppInstance {
    fn saved_dir(&self) -> PathBuf {
        self.local_cache.join("Saved")
    }

    async fn pull_artifacts(&self) {
        let local = self.local_cache.to_string_lossy().into_owned();
        let budget = self.adb.services.config.install_budget();

        match self
            .adb
            .adb_with_budget(&["pull", &self.artifact_dir, &local], budget)
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(
                "Failed to pull artifacts from {}: {}",
                self.adb.serial(),
                out.output.trim()
            ),
            Err(e) => tracing::warn!("Failed to pull artifacts from {}: {}", self.adb.serial(), e),
        }

        match self.adb.adb(&["logcat", "-d"]).await {
            Ok(out) => {
                let saved = self.saved_dir();
                let written = std::fs::create_dir_all(&saved)
                    .and_then(|_| std::fs::write(saved.join("Logcat.log"), out.output));
                if let Err(e) = written {
                    tracing::warn!("Failed to save logcat: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to capture logcat: {}", e),
        }

        if let Err(e) = self
            .adb
            .shell(&format!("rm -f {}", self.command_line_path))
            .await
        {
            tracing::warn!("Failed to remove command line file: {}", e);
        }
    }
}

#[async_trait]
impl AppInstance for AndroidAppInstance {
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
        if !self.launch.has_exited() {
            return false;
        }
        self.liveness.has_exited().await
    }

    fn was_killed(&self) -> bool {
        self.was_killed.load(Ordering::SeqCst)
    }

    async fn exit_code(&self) -> Option<i32> {
        if !self.has_exited().await {
            return None;
        }
        if self.was_killed() {
            return Some(-1);
        }
        self.launch.exit_code()
    }

    async fn std_out(&self) -> String {
        let exited = self.has_exited().await;
        self.log.get(exited).await
    }

    async fn artifact_path(&self) -> PathBuf {
        if self.has_exited().await {
            self.artifacts.get_or_init(|| self.pull_artifacts()).await;
        }
        self.saved_dir()
    }

    async fn kill(&self) -> Result<()> {
        if self.launch.has_exited() && self.liveness.refresh().await {
            return Ok(());
        }
        self.was_killed.store(true, Ordering::SeqCst);
        let result = self
            .adb
            .shell(&format!("am force-stop {}", self.install.package_name))
            .await;
        self.liveness.mark_exited();
        self.launch.kill();
        result.map(|_| ())
    }
}
