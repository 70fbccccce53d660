//! Cross-platform configuration, log and cache paths
//!
//! Linux: `~/.config/devicelab/`, `~/.local/share/devicelab/`, `~/.cache/devicelab/`
//! macOS: `~/Library/Application Support/devicelab/`, `~/Library/Caches/devicelab/`
//! Windows: `%APPDATA%\devicelab\`, `%LOCALAPPDATA%\devicelab\`

use std::io;
use std::path::PathBuf;

/// Application name used for all directories
const APP_NAME: &str = "devicelab";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Root directory for per-device caches and extracted packages
///
/// Falls back to the system temp directory
pub fn cache_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}

/// Directory where the host's adb keys live (`~/.android`)
pub fn android_key_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".android"))
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir() -> io::Result<Option<PathBuf>> {
    if let Some(dir) = config_dir() {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Some(dir))
    } else {
        Ok(None)
    }
}

/// Replace characters that are not valid in file names (e.g. `:` in network serials)
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ':' | '/' | '\\' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_dir_is_valid() {
        let dir = cache_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[test]
    fn test_sanitize_network_serial() {
        assert_eq!(sanitize_name("192.168.1.20:5555"), "192.168.1.20_5555");
        assert_eq!(sanitize_name("R58M123"), "R58M123");
    }
}
