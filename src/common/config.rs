//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;
use crate::build::Platform;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// External bridge tools
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Throttling of remote liveness/log queries
    #[serde(default)]
    pub polling: PollingConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Test driver settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Command line composition
    #[serde(default)]
    pub session: SessionConfig,

    /// Android specific settings
    #[serde(default)]
    pub android: AndroidConfig,

    /// Devices available to the pool
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Paths to the bridge tools used to talk to devices
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ToolsConfig {
    /// Path to adb
    pub adb: Option<PathBuf>,

    /// Path to ios-deploy
    pub ios_deploy: Option<PathBuf>,
}

/// Minimum intervals between remote queries, in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    /// Interval between remote liveness checks
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Interval between remote log fetches
    #[serde(default = "default_log_interval")]
    pub log_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: default_liveness_interval(),
            log_interval_secs: default_log_interval(),
        }
    }
}

fn default_liveness_interval() -> u64 {
    10
}
fn default_log_interval() -> u64 {
    15
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Wait budget for an ordinary device command
    #[serde(default = "default_command")]
    pub command_secs: u64,

    /// Wait budget for package installs and bulk uploads
    #[serde(default = "default_install")]
    pub install_secs: u64,

    /// How long to wait for a killed command to go away
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Delay after launching before checking for an early exit
    #[serde(default = "default_launch_settle")]
    pub launch_settle_secs: u64,

    /// Delay after (re)starting the adb server or connecting a network device
    #[serde(default = "default_adb_settle")]
    pub adb_settle_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command(),
            install_secs: default_install(),
            kill_grace_secs: default_kill_grace(),
            launch_settle_secs: default_launch_settle(),
            adb_settle_secs: default_adb_settle(),
        }
    }
}

fn default_command() -> u64 {
    60
}
fn default_install() -> u64 {
    600
}
fn default_kill_grace() -> u64 {
    15
}
fn default_launch_settle() -> u64 {
    5
}
fn default_adb_settle() -> u64 {
    5
}

/// Test driver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// Delay between ticks, in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Maximum number of tests in progress at once
    #[serde(default = "default_max_parallel_tests")]
    pub max_parallel_tests: usize,

    /// Maximum number of device commands in flight at once
    #[serde(default = "default_max_parallel_commands")]
    pub max_parallel_commands: usize,

    /// How many times a test asking for a retry is restarted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Number of passes of each test
    #[serde(default = "default_passes")]
    pub passes: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            max_parallel_tests: default_max_parallel_tests(),
            max_parallel_commands: default_max_parallel_commands(),
            max_retries: default_max_retries(),
            passes: default_passes(),
        }
    }
}

fn default_tick_interval() -> u64 {
    1000
}
fn default_max_parallel_tests() -> usize {
    4
}
fn default_max_parallel_commands() -> usize {
    8
}
fn default_max_retries() -> u32 {
    1
}
fn default_passes() -> u32 {
    1
}

/// Command line blocks shared by every role of a session
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Arguments added to every role
    #[serde(default = "default_common_args")]
    pub common_args: String,

    /// Project level defaults, added after the common block
    #[serde(default)]
    pub project_args: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            common_args: default_common_args(),
            project_args: String::new(),
        }
    }
}

fn default_common_args() -> String {
    "-unattended -nopause -nosplash -log".to_string()
}

/// Android backend settings
#[derive(Debug, Deserialize, Clone)]
pub struct AndroidConfig {
    /// Activity launched with `am start`
    #[serde(default = "default_launch_activity")]
    pub launch_activity: String,

    /// Directory under external storage that holds project data
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    /// Directory on the device holding differential deployment records
    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,

    /// Reuse whatever is installed on the device
    #[serde(default)]
    pub skip_deploy: bool,

    /// Uninstall and wipe previous data before installing
    #[serde(default)]
    pub clean_device: bool,

    /// Directory holding the host's adb keys (defaults to ~/.android)
    pub key_dir: Option<PathBuf>,
}

impl Default for AndroidConfig {
    fn default() -> Self {
        Self {
            launch_activity: default_launch_activity(),
            remote_root: default_remote_root(),
            dependency_dir: default_dependency_dir(),
            skip_deploy: false,
            clean_device: false,
            key_dir: None,
        }
    }
}

fn default_launch_activity() -> String {
    "com.epicgames.ue4.SplashActivity".to_string()
}
fn default_remote_root() -> String {
    "UE4Game".to_string()
}
fn default_dependency_dir() -> String {
    "/sdcard/gdeps".to_string()
}

/// A device made available to the pool
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceEntry {
    /// Platform the device runs
    pub platform: Platform,

    /// Device name: serial, address, UUID or "default"
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Backend specific parameter, as JSON
    pub param: Option<String>,
}

fn default_device_name() -> String {
    "default".to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::from_path(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Resolve the path to adb
    ///
    /// Falls back to searching PATH if not explicitly configured
    pub fn adb_path(&self) -> PathBuf {
        resolve_tool(self.tools.adb.as_deref(), "adb")
    }

    /// Resolve the path to ios-deploy
    pub fn ios_deploy_path(&self) -> PathBuf {
        resolve_tool(self.tools.ios_deploy.as_deref(), "ios-deploy")
    }

    pub fn command_budget(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }

    pub fn install_budget(&self) -> Duration {
        Duration::from_secs(self.timeouts.install_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.kill_grace_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.polling.liveness_interval_secs)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.polling.log_interval_secs)
    }
}

fn resolve_tool(configured: Option<&Path>, name: &str) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.polling.liveness_interval_secs, 10);
        assert_eq!(config.polling.log_interval_secs, 15);
        assert_eq!(config.timeouts.kill_grace_secs, 15);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
[polling]
log_interval_secs = 5

[executor]
max_retries = 3

[[devices]]
platform = "Android"
name = "192.168.1.20"
param = '{"hostIP":"10.0.0.1"}'
"#,
        )
        .unwrap();

        assert_eq!(config.polling.log_interval_secs, 5);
        assert_eq!(config.polling.liveness_interval_secs, 10);
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].platform, Platform::Android);
    }

    #[test]
    fn test_configured_tool_wins() {
        let mut config = Config::default();
        config.tools.adb = Some(PathBuf::from("/opt/sdk/platform-tools/adb"));
        assert_eq!(
            config.adb_path(),
            PathBuf::from("/opt/sdk/platform-tools/adb")
        );
    }
}
