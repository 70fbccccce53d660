//! Android build discovery
//!
//! Packaged Android builds ship with a generated install script
//! (`Install_<Name>.bat` / `.sh`) that uninstalls the previous package,
//! installs the APK and pushes any data files. Everything we need is read
//! from that script.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::catalog::candidate_directories;
use super::naming::parse_build_name;
use super::{Build, BuildArtifact, BuildFlags, BuildSource, Platform};
use crate::common::{Error, Result};

const SCRIPT_PREFIX: &str = "Install_";

/// Architecture suffixes appended to Android build names
const ARCHITECTURES: &[&str] = &["arm64", "armv7", "x86", "x64", "x86_64"];

static UNINSTALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)\buninstall\s+(\S+)").expect("static regex"));
static INSTALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)\binstall\s+(?:-\w+\s+)*"?([^"\s]+\.apk)"?"#).expect("static regex")
});
static PUSH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)\bpush\s+"?([^"\s]+)"?\s+"?([^"\s]+)"?"#).expect("static regex")
});
static SCRIPT_DIR_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(%~dp0[\\/]?|\$\{?DIR\}?/|\$\(dirname "\$0"\)/)"#).expect("static regex")
});

/// What an install script tells us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallScript {
    pub package_name: String,
    pub apk: String,
    /// Data files as (source relative to the script, device destination)
    pub pushes: Vec<(String, String)>,
}

/// Parse the content of an install script
pub fn parse_install_script(path: &Path, content: &str) -> Result<InstallScript> {
    let package_name = UNINSTALL
        .captures(content)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::manifest(path, "no uninstall directive"))?;

    let apk = INSTALL
        .captures(content)
        .map(|c| strip_script_dir(&c[1]))
        .ok_or_else(|| Error::manifest(path, "no APK install directive"))?;

    let pushes = PUSH
        .captures_iter(content)
        .map(|c| (strip_script_dir(&c[1]), c[2].to_string()))
        .collect();

    Ok(InstallScript {
        package_name,
        apk,
        pushes,
    })
}

fn strip_script_dir(path: &str) -> String {
    SCRIPT_DIR_VAR.replace(path, "").into_owned()
}

/// Build name encoded in a script filename, without prefix, extension or
/// architecture suffix
pub fn build_name_from_script(file_name: &str) -> Option<String> {
    let stem = file_name
        .strip_prefix(SCRIPT_PREFIX)?
        .trim_end_matches(".bat")
        .trim_end_matches(".sh");

    let name = match stem.rsplit_once('-') {
        Some((head, arch))
            if ARCHITECTURES
                .iter()
                .any(|a| a.eq_ignore_ascii_case(arch)) =>
        {
            head
        }
        _ => stem,
    };
    Some(name.to_string())
}

/// Finds packaged Android builds by their install scripts
pub struct AndroidBuildSource;

impl AndroidBuildSource {
    fn build_from_script(&self, project: &str, dir: &Path, script: &Path) -> Result<Option<Build>> {
        let file_name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(name) = build_name_from_script(&file_name) else {
            return Ok(None);
        };
        let Some(parsed) = parse_build_name(project, &format!("{}.apk", name)) else {
            return Ok(None);
        };

        let content = std::fs::read_to_string(script).map_err(|e| Error::FileRead {
            path: script.display().to_string(),
            error: e.to_string(),
        })?;
        let manifest = parse_install_script(script, &content)?;

        let apk_path = dir.join(&manifest.apk);
        if !apk_path.exists() {
            return Err(Error::manifest(
                script,
                &format!("APK {} does not exist", apk_path.display()),
            ));
        }

        let mut files = BTreeMap::new();
        for (source, destination) in &manifest.pushes {
            files.insert(dir.join(source), destination.clone());
        }

        let mut flags =
            BuildFlags::PACKAGED | BuildFlags::CAN_REPLACE_COMMAND_LINE | parsed.flags();
        if !files.is_empty() {
            flags |= BuildFlags::CAN_REPLACE_EXECUTABLE;
        }
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if dir_name.contains("bulk") {
            flags |= BuildFlags::BULK;
        }

        Ok(Some(Build {
            platform: Platform::Android,
            configuration: parsed.configuration,
            role: parsed.role,
            shared: parsed.shared,
            flags,
            package_name: manifest.package_name,
            artifact: BuildArtifact {
                package_path: apk_path,
                files,
            },
            source_dir: dir.to_path_buf(),
            source: self.build_name(),
        }))
    }
}

impl BuildSource for AndroidBuildSource {
    fn build_name(&self) -> &'static str {
        "AndroidBuildSource"
    }

    fn can_support_platform(&self, platform: Platform) -> bool {
        platform == Platform::Android
    }

    fn get_builds_at_path(&self, project: &str, path: &Path, max_recursion: usize) -> Vec<Build> {
        let mut builds = Vec::new();

        for dir in candidate_directories(path, Platform::Android, max_recursion) {
            let scripts = install_scripts(&dir);
            if scripts.is_empty() {
                tracing::warn!("Skipping {}: no {} install script", dir.display(), SCRIPT_PREFIX);
                continue;
            }
            for script in scripts {
                match self.build_from_script(project, &dir, &script) {
                    Ok(Some(build)) => builds.push(build),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Skipping {}: {}", script.display(), e),
                }
            }
        }

        builds
    }
}

fn install_scripts(dir: &Path) -> Vec<PathBuf> {
    let ext = if cfg!(windows) { "bat" } else { "sh" };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut scripts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.starts_with(SCRIPT_PREFIX)
                && p.extension().map(|e| e == ext).unwrap_or(false)
        })
        .collect();
    scripts.sort();
    scripts
}
