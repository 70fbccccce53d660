//! Builds and build discovery
//!
//! A [`Build`] is an installable package found on disk by a [`BuildSource`].
//! Builds are immutable once discovered; devices read them when installing.

pub mod android;
pub mod catalog;
pub mod ios;
pub mod naming;
pub mod staged;

use bitflags::bitflags;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use catalog::BuildCatalog;

/// Target platforms known to the catalog and device registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum Platform {
    Win64,
    Win32,
    Mac,
    Linux,
    Android,
    IOS,
    TVOS,
    PS4,
    XboxOne,
    Switch,
    HTML5,
    Lumin,
}

impl Platform {
    pub const ALL: &'static [Platform] = &[
        Platform::Win64,
        Platform::Win32,
        Platform::Mac,
        Platform::Linux,
        Platform::Android,
        Platform::IOS,
        Platform::TVOS,
        Platform::PS4,
        Platform::XboxOne,
        Platform::Switch,
        Platform::HTML5,
        Platform::Lumin,
    ];

    /// Canonical name, as it appears in build filenames
    pub fn name(self) -> &'static str {
        match self {
            Platform::Win64 => "Win64",
            Platform::Win32 => "Win32",
            Platform::Mac => "Mac",
            Platform::Linux => "Linux",
            Platform::Android => "Android",
            Platform::IOS => "IOS",
            Platform::TVOS => "TVOS",
            Platform::PS4 => "PS4",
            Platform::XboxOne => "XboxOne",
            Platform::Switch => "Switch",
            Platform::HTML5 => "HTML5",
            Platform::Lumin => "Lumin",
        }
    }

    /// Case-insensitive lookup by canonical name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// The platform of the machine we are running on
    pub fn host() -> Self {
        #[cfg(target_os = "windows")]
        return Platform::Win64;

        #[cfg(target_os = "macos")]
        return Platform::Mac;

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        return Platform::Linux;
    }

    /// Desktop platforms run directly on a host machine
    pub fn is_desktop(self) -> bool {
        matches!(
            self,
            Platform::Win64 | Platform::Win32 | Platform::Mac | Platform::Linux
        )
    }

    /// Prefix of staged/packaged directory names for this platform
    /// (`WindowsNoEditor`, `Android_ASTC`, ...)
    pub fn directory_prefix(self) -> &'static str {
        match self {
            Platform::Win64 | Platform::Win32 => "Windows",
            other => other.name(),
        }
    }

    /// Extension of a runnable executable, without the dot
    pub fn executable_extension(self) -> Option<&'static str> {
        match self {
            Platform::Win64 | Platform::Win32 | Platform::XboxOne => Some("exe"),
            Platform::Mac => Some("app"),
            Platform::Android => Some("apk"),
            Platform::IOS | Platform::TVOS => Some("ipa"),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown platform '{}'", s))
    }
}

impl TryFrom<String> for Platform {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Build configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Configuration {
    Debug,
    DebugGame,
    #[default]
    Development,
    Test,
    Shipping,
}

impl Configuration {
    pub const ALL: &'static [Configuration] = &[
        Configuration::Debug,
        Configuration::DebugGame,
        Configuration::Development,
        Configuration::Test,
        Configuration::Shipping,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Configuration::Debug => "Debug",
            Configuration::DebugGame => "DebugGame",
            Configuration::Development => "Development",
            Configuration::Test => "Test",
            Configuration::Shipping => "Shipping",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Configuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown configuration '{}'", s))
    }
}

impl TryFrom<String> for Configuration {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The part a process plays in a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum RoleType {
    Client,
    Server,
    Editor,
    EditorGame,
    EditorServer,
}

impl RoleType {
    pub const ALL: &'static [RoleType] = &[
        RoleType::Client,
        RoleType::Server,
        RoleType::Editor,
        RoleType::EditorGame,
        RoleType::EditorServer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RoleType::Client => "Client",
            RoleType::Server => "Server",
            RoleType::Editor => "Editor",
            RoleType::EditorGame => "EditorGame",
            RoleType::EditorServer => "EditorServer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }

    pub fn is_client(self) -> bool {
        matches!(self, RoleType::Client | RoleType::EditorGame)
    }

    pub fn is_server(self) -> bool {
        matches!(self, RoleType::Server | RoleType::EditorServer)
    }

    /// Roles that run inside the editor executable
    pub fn uses_editor(self) -> bool {
        matches!(
            self,
            RoleType::Editor | RoleType::EditorGame | RoleType::EditorServer
        )
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RoleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown role '{}'", s))
    }
}

impl TryFrom<String> for RoleType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

bitflags! {
    /// Structural properties of a build
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        /// Installed as a single package (apk, ipa)
        const PACKAGED = 1 << 0;
        /// A staged directory of loose files
        const LOOSE = 1 << 1;
        /// The command line can be supplied at launch
        const CAN_REPLACE_COMMAND_LINE = 1 << 2;
        /// Data lives outside the executable, so the executable can be swapped alone
        const CAN_REPLACE_EXECUTABLE = 1 << 3;
        /// Data is bundled in bulk on external storage
        const BULK = 1 << 4;
        /// Built without project code, runs under the generic engine executable
        const CONTENT_ONLY = 1 << 5;
    }
}

impl fmt::Display for BuildFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

/// What gets transferred to a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildArtifact {
    /// The package file (apk, ipa) or the staged root directory
    pub package_path: PathBuf,
    /// Extra data files and where they go on the device
    pub files: BTreeMap<PathBuf, String>,
}

/// An installable build discovered on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub platform: Platform,
    pub configuration: Configuration,
    pub role: RoleType,
    /// A generic game build that can act as more than one role
    pub shared: bool,
    pub flags: BuildFlags,
    /// Package identifier (Android package, iOS bundle id) or the
    /// executable path relative to the staged root for loose builds
    pub package_name: String,
    pub artifact: BuildArtifact,
    /// Directory the build was found in
    pub source_dir: PathBuf,
    /// Name of the build source that produced it
    pub source: &'static str,
}

impl Build {
    /// Whether this build can play `role`
    pub fn can_run_role(&self, role: RoleType) -> bool {
        match role {
            RoleType::Client => self.role == RoleType::Client,
            RoleType::Server => {
                self.role == RoleType::Server || (self.shared && self.role == RoleType::Client)
            }
            RoleType::Editor | RoleType::EditorGame | RoleType::EditorServer => {
                self.role == RoleType::Editor
            }
        }
    }

    pub fn has_flags(&self, flags: BuildFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Short description used in logs and CLI output
    pub fn describe(&self) -> String {
        format!(
            "{} {} {}{} [{}] {}",
            self.platform,
            self.configuration,
            self.role,
            if self.shared { " (shared)" } else { "" },
            self.flags,
            self.package_name
        )
    }
}

/// A plugin that finds builds for some platforms
pub trait BuildSource: Send + Sync {
    /// Name of this source, for logs
    fn build_name(&self) -> &'static str;

    fn can_support_platform(&self, platform: Platform) -> bool;

    /// Scan `path` (up to `max_recursion` directory levels) for builds of `project`.
    ///
    /// Malformed or incomplete candidates are skipped with a warning.
    fn get_builds_at_path(&self, project: &str, path: &Path, max_recursion: usize) -> Vec<Build>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(role: RoleType, shared: bool) -> Build {
        Build {
            platform: Platform::Win64,
            configuration: Configuration::Test,
            role,
            shared,
            flags: BuildFlags::LOOSE,
            package_name: "Fortnite/Binaries/Win64/FortniteClient-Win64-Test.exe".into(),
            artifact: BuildArtifact::default(),
            source_dir: PathBuf::from("/builds"),
            source: "test",
        }
    }

    #[test]
    fn test_platform_names_case_insensitive() {
        assert_eq!(Platform::from_name("win64"), Some(Platform::Win64));
        assert_eq!("ios".parse::<Platform>().unwrap(), Platform::IOS);
        assert!("Amiga".parse::<Platform>().is_err());
        assert_eq!(Platform::Win64.directory_prefix(), "Windows");
    }

    #[test]
    fn test_configuration_default() {
        assert_eq!(Configuration::default(), Configuration::Development);
        assert_eq!(
            Configuration::from_name("debuggame"),
            Some(Configuration::DebugGame)
        );
    }

    #[test]
    fn test_role_support() {
        let shared = build(RoleType::Client, true);
        assert!(shared.can_run_role(RoleType::Client));
        assert!(shared.can_run_role(RoleType::Server));
        assert!(!shared.can_run_role(RoleType::Editor));

        let client = build(RoleType::Client, false);
        assert!(!client.can_run_role(RoleType::Server));

        let editor = build(RoleType::Editor, false);
        assert!(editor.can_run_role(RoleType::EditorGame));
    }

    #[test]
    fn test_flags_display() {
        let flags = BuildFlags::PACKAGED | BuildFlags::BULK;
        assert_eq!(flags.to_string(), "PACKAGED|BULK");
        assert_eq!(BuildFlags::empty().to_string(), "-");
    }
}
