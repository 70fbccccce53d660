//! Devices, installs and running instances
//!
//! A [`Device`] is a platform-specific handle that can install a build and
//! run it. Installing yields an [`AppInstall`]; running consumes it and yields
//! an [`AppInstance`] that the test driver polls.
//!
//! Device state machine:
//!
//! ```text
//! Unconnected -> Connected -> Busy (install/run) -> Connected -> Disconnected
//! ```

pub mod android;
pub mod credentials;
pub mod deploy;
pub mod desktop;
pub mod factory;
pub mod ios;
pub mod lldb;
pub mod null;
pub mod pool;
pub mod throttle;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::{Build, Platform, RoleType};
use crate::common::{Error, Result};

pub use factory::{DeviceFactory, DeviceRegistry};
pub use pool::DevicePool;

/// Connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unconnected,
    Connected,
    Busy,
    Disconnected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Unconnected => write!(f, "unconnected"),
            DeviceState::Connected => write!(f, "connected"),
            DeviceState::Busy => write!(f, "busy"),
            DeviceState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Logical destinations for files copied next to an installed build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum LogicalDirectory {
    Binaries,
    Config,
    Content,
    Saved,
    Demos,
    Profiling,
}

impl LogicalDirectory {
    pub const ALL: &'static [LogicalDirectory] = &[
        LogicalDirectory::Binaries,
        LogicalDirectory::Config,
        LogicalDirectory::Content,
        LogicalDirectory::Saved,
        LogicalDirectory::Demos,
        LogicalDirectory::Profiling,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LogicalDirectory::Binaries => "Binaries",
            LogicalDirectory::Config => "Config",
            LogicalDirectory::Content => "Content",
            LogicalDirectory::Saved => "Saved",
            LogicalDirectory::Demos => "Demos",
            LogicalDirectory::Profiling => "Profiling",
        }
    }
}

/// Mapping from logical to physical directories, rooted at `base`.
/// `Saved` is the base itself; everything else lives below it.
pub fn directory_mappings(base: &str) -> HashMap<LogicalDirectory, String> {
    let base = base.trim_end_matches('/');
    LogicalDirectory::ALL
        .iter()
        .map(|&dir| {
            let path = match dir {
                LogicalDirectory::Saved => base.to_string(),
                other => format!("{}/{}", base, other.name()),
            };
            (dir, path)
        })
        .collect()
}

/// A file to place in one of the logical directories
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileToCopy {
    pub source: PathBuf,
    pub directory: LogicalDirectory,
    /// Path relative to the logical directory
    pub relative_path: String,
}

/// Everything a device needs to install one role
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Name of the install (the project name)
    pub name: String,
    pub project: String,
    pub role: RoleType,
    pub build: Build,
    pub command_line: String,
    pub files_to_copy: Vec<FileToCopy>,
}

/// An application installed on a device but not yet running
///
/// Consumed by [`Device::run`].
#[derive(Debug)]
pub struct AppInstall {
    pub name: String,
    pub device_name: String,
    pub command_line: String,
    pub package_name: String,
    pub role: RoleType,
    /// Executable launched directly by host-side devices
    pub executable: Option<PathBuf>,
    /// Working directory for directly launched executables
    pub working_dir: Option<PathBuf>,
}

/// A running (or exited) application
#[async_trait]
pub trait AppInstance: Send + Sync {
    /// Name of the install this instance came from
    fn name(&self) -> &str;

    fn device_name(&self) -> &str;

    fn command_line(&self) -> &str;

    /// Whether the application has exited. Cheap to call often; remote
    /// checks are throttled.
    async fn has_exited(&self) -> bool;

    /// Whether [`AppInstance::kill`] terminated the application
    fn was_killed(&self) -> bool;

    /// Exit code once exited
    async fn exit_code(&self) -> Option<i32>;

    /// Output captured so far
    async fn std_out(&self) -> String;

    /// Local directory holding the application's saved artifacts. The first
    /// call after exit pulls them from the device.
    async fn artifact_path(&self) -> PathBuf;

    /// Force-terminate. No-op once exited.
    async fn kill(&self) -> Result<()>;
}

/// A place builds can be installed and run
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable identity, also used as cache and lock key
    fn name(&self) -> &str;

    fn platform(&self) -> Platform;

    fn state(&self) -> DeviceState;

    /// Local scratch directory owned by this device
    fn local_cache_dir(&self) -> &Path;

    fn is_connected(&self) -> bool {
        matches!(self.state(), DeviceState::Connected | DeviceState::Busy)
    }

    /// Connect. Connecting a connected device does nothing.
    async fn connect(&self) -> Result<()>;

    /// Disconnect and release everything the device holds. Every step is
    /// attempted; the first error is returned. Disconnecting twice does nothing.
    async fn disconnect(&self) -> Result<()>;

    async fn is_on(&self) -> Result<bool> {
        Ok(true)
    }

    async fn power_on(&self) -> Result<()> {
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        Ok(())
    }

    async fn install_application(&self, config: &AppConfig) -> Result<AppInstall>;

    async fn run(&self, install: AppInstall) -> Result<Arc<dyn AppInstance>>;

    /// Physical locations of the logical directories, known after install
    fn platform_directory_mappings(&self) -> HashMap<LogicalDirectory, String>;
}

/// Holds a device's state and enforces valid transitions
#[derive(Debug)]
pub struct StateCell(std::sync::Mutex<DeviceState>);

impl Default for StateCell {
    fn default() -> Self {
        Self(std::sync::Mutex::new(DeviceState::Unconnected))
    }
}

impl StateCell {
    pub fn get(&self) -> DeviceState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, state: DeviceState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Enter `Busy` for an install or run
    pub fn begin(&self, action: &str) -> Result<()> {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            DeviceState::Connected => {
                *state = DeviceState::Busy;
                Ok(())
            }
            other => Err(Error::invalid_state(action, &other.to_string())),
        }
    }

    /// Leave `Busy`
    pub fn end(&self) {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if *state == DeviceState::Busy {
            *state = DeviceState::Connected;
        }
    }
}

/// Warn about directory mappings read before install
pub(crate) fn mappings_or_warn(
    device: &str,
    mappings: &HashMap<LogicalDirectory, String>,
) -> HashMap<LogicalDirectory, String> {
    if mappings.is_empty() {
        tracing::warn!(
            "{}: platform directory mappings requested before install_application populated them",
            device
        );
    }
    mappings.clone()
}

/// Resolve files to copy against a device's directory mappings. Missing
/// sources are skipped with a warning.
pub fn resolve_files_to_copy(
    files: &[FileToCopy],
    mappings: &HashMap<LogicalDirectory, String>,
) -> Vec<(PathBuf, String)> {
    let mut resolved = Vec::new();
    for file in files {
        let Some(base) = mappings.get(&file.directory) else {
            tracing::warn!("No mapping for {:?}, skipping {}", file.directory, file.source.display());
            continue;
        };
        if !file.source.exists() {
            tracing::warn!("File to copy {} not found", file.source.display());
            continue;
        }
        let relative = file.relative_path.replace('\\', "/");
        resolved.push((
            file.source.clone(),
            format!("{}/{}", base.trim_end_matches('/'), relative.trim_start_matches('/')),
        ));
    }
    resolved
}
