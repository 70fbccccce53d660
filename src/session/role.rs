//! Session roles and command line composition

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::build::{Build, BuildFlags, Configuration, Platform, RoleType};
use crate::common::config::SessionConfig;
use crate::common::{quote_if_needed, split_command_line};
use crate::device::{AppConfig, FileToCopy};

/// How a role deviates from a normal one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RoleModifier {
    #[default]
    None,
    /// An extra participant whose results are not judged
    Dummy,
    /// Needs no device; installs and runs nothing
    Null,
}

/// Adjusts the configuration of a role just before install
///
/// Options are applied in order, so later options override earlier ones.
pub trait ConfigOption: Send + Sync {
    fn apply(&self, config: &mut AppConfig);
}

impl<F> ConfigOption for F
where
    F: Fn(&mut AppConfig) + Send + Sync,
{
    fn apply(&self, config: &mut AppConfig) {
        self(config)
    }
}

/// Appends arguments to the command line
#[derive(Debug, Clone)]
pub struct AddArgs(pub String);

impl ConfigOption for AddArgs {
    fn apply(&self, config: &mut AppConfig) {
        append_args(&mut config.command_line, &self.0);
    }
}

/// Removes an argument, with or without a `=value` suffix
#[derive(Debug, Clone)]
pub struct RemoveArg(pub String);

impl ConfigOption for RemoveArg {
    fn apply(&self, config: &mut AppConfig) {
        config.command_line = remove_arg(&config.command_line, &self.0);
    }
}

/// Sets `-name=value`, replacing any earlier value
#[derive(Debug, Clone)]
pub struct SetArg {
    pub name: String,
    pub value: String,
}

impl ConfigOption for SetArg {
    fn apply(&self, config: &mut AppConfig) {
        let name = self.name.trim_start_matches('-');
        let stripped = remove_arg(&config.command_line, name);
        config.command_line = stripped;
        append_args(
            &mut config.command_line,
            &quote_if_needed(&format!("-{}={}", name, self.value)),
        );
    }
}

fn append_args(line: &mut String, args: &str) {
    let args = args.trim();
    if args.is_empty() {
        return;
    }
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(args);
}

/// Drop every occurrence of `-name` or `-name=...` (case-insensitive)
pub fn remove_arg(line: &str, name: &str) -> String {
    let name = name.trim_start_matches('-').to_ascii_lowercase();
    split_command_line(line)
        .into_iter()
        .filter(|arg| {
            let bare = arg.trim_start_matches('-').to_ascii_lowercase();
            let key = bare.split('=').next().unwrap_or_default();
            !(arg.starts_with('-') && key == name)
        })
        .map(|arg| quote_if_needed(&arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One participant in a session
#[derive(Clone)]
pub struct SessionRole {
    pub role_type: RoleType,
    pub platform: Platform,
    pub configuration: Configuration,
    /// Role specific arguments, added after the shared blocks
    pub command_line: String,
    pub options: Vec<Arc<dyn ConfigOption>>,
    pub files_to_copy: Vec<FileToCopy>,
    pub required_flags: BuildFlags,
    pub modifier: RoleModifier,
}

impl fmt::Debug for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRole")
            .field("role_type", &self.role_type)
            .field("platform", &self.platform)
            .field("configuration", &self.configuration)
            .field("command_line", &self.command_line)
            .field("options", &self.options.len())
            .field("required_flags", &self.required_flags)
            .field("modifier", &self.modifier)
            .finish()
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.platform, self.configuration, self.name())
    }
}

impl SessionRole {
    pub fn new(role_type: RoleType, platform: Platform, configuration: Configuration) -> Self {
        Self {
            role_type,
            platform,
            configuration,
            command_line: String::new(),
            options: Vec::new(),
            files_to_copy: Vec::new(),
            required_flags: BuildFlags::empty(),
            modifier: RoleModifier::None,
        }
    }

    pub fn with_command_line(mut self, args: &str) -> Self {
        append_args(&mut self.command_line, args);
        self
    }

    pub fn with_option(mut self, option: impl ConfigOption + 'static) -> Self {
        self.options.push(Arc::new(option));
        self
    }

    pub fn with_files(mut self, files: Vec<FileToCopy>) -> Self {
        self.files_to_copy.extend(files);
        self
    }

    pub fn with_required_flags(mut self, flags: BuildFlags) -> Self {
        self.required_flags |= flags;
        self
    }

    pub fn with_modifier(mut self, modifier: RoleModifier) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn is_dummy(&self) -> bool {
        self.modifier == RoleModifier::Dummy
    }

    pub fn is_null(&self) -> bool {
        self.modifier == RoleModifier::Null
    }

    /// `Client`, `DummyClient`, `Server`, ...
    pub fn name(&self) -> String {
        if self.is_dummy() {
            format!("Dummy{}", self.role_type)
        } else {
            self.role_type.to_string()
        }
    }

    /// Flags a build must carry to play this role. `dev` iteration swaps the
    /// executable, `bulk` data lives on external storage.
    pub fn effective_flags(&self) -> BuildFlags {
        let mut flags = self.required_flags;
        let args = self.command_line.to_ascii_lowercase();
        let has = |name: &str| {
            split_command_line(&args)
                .iter()
                .any(|a| a.trim_start_matches('-') == name)
        };
        if has("dev") && !self.role_type.uses_editor() {
            flags |= BuildFlags::CAN_REPLACE_EXECUTABLE;
        }
        if has("bulk") && self.platform == Platform::Android {
            flags |= BuildFlags::BULK;
        }
        flags
    }

    /// The configuration handed to the device for this role
    ///
    /// Command line order: role defaults, the common block, project defaults,
    /// role arguments, then every option in order.
    pub fn app_config(&self, project: &str, build: &Build, session: &SessionConfig) -> AppConfig {
        let mut command_line = String::new();
        append_args(&mut command_line, &base_arguments(self.role_type, project, build));
        append_args(&mut command_line, &session.common_args);
        append_args(&mut command_line, &session.project_args);
        append_args(&mut command_line, &self.command_line);

        let mut config = AppConfig {
            name: project.to_string(),
            project: project.to_string(),
            role: self.role_type,
            build: build.clone(),
            command_line,
            files_to_copy: self.files_to_copy.clone(),
        };
        for option in &self.options {
            option.apply(&mut config);
        }
        config
    }
}

/// Arguments every instance of a role starts with
pub fn base_arguments(role: RoleType, project: &str, build: &Build) -> String {
    match role {
        RoleType::Client => String::new(),
        RoleType::Server if build.role == RoleType::Server => String::new(),
        RoleType::Server => "-server".to_string(),
        RoleType::Editor => project.to_string(),
        RoleType::EditorGame => format!("{} -game", project),
        RoleType::EditorServer => format!("{} -server", project),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildArtifact;
    use std::path::PathBuf;

    fn build(role: RoleType, shared: bool) -> Build {
        Build {
            platform: Platform::Android,
            configuration: Configuration::Test,
            role,
            shared,
            flags: BuildFlags::PACKAGED,
            package_name: "com.epicgames.orion".into(),
            artifact: BuildArtifact::default(),
            source_dir: PathBuf::from("/builds"),
            source: "AndroidBuildSource",
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            common_args: "-unattended -log".into(),
            project_args: "-ini:Engine:[Core.Log]:LogNet=Verbose".into(),
        }
    }

    #[test]
    fn test_command_line_order() {
        let role = SessionRole::new(RoleType::Server, Platform::Android, Configuration::Test)
            .with_command_line("-port=7777");
        let config = role.app_config("OrionGame", &build(RoleType::Client, true), &session_config());
        assert_eq!(
            config.command_line,
            "-server -unattended -log -ini:Engine:[Core.Log]:LogNet=Verbose -port=7777"
        );
        assert_eq!(config.role, RoleType::Server);
    }

    #[test]
    fn test_options_apply_in_order() {
        let role = SessionRole::new(RoleType::Client, Platform::Android, Configuration::Test)
            .with_command_line("-port=7777 -nullrhi")
            .with_option(SetArg {
                name: "port".into(),
                value: "8888".into(),
            })
            .with_option(RemoveArg("-log".into()))
            .with_option(AddArgs("-ExecCmds=\"Automation RunAll\"".into()))
            .with_option(|config: &mut AppConfig| config.name = "Orion".into());

        let config = role.app_config("OrionGame", &build(RoleType::Client, false), &session_config());
        assert_eq!(
            config.command_line,
            "-unattended -ini:Engine:[Core.Log]:LogNet=Verbose -nullrhi -port=8888 -ExecCmds=\"Automation RunAll\""
        );
        assert_eq!(config.name, "Orion");
    }

    #[test]
    fn test_effective_flags() {
        let role = SessionRole::new(RoleType::Client, Platform::Android, Configuration::Test)
            .with_command_line("-dev -bulk");
        assert_eq!(
            role.effective_flags(),
            BuildFlags::CAN_REPLACE_EXECUTABLE | BuildFlags::BULK
        );

        let editor = SessionRole::new(RoleType::EditorGame, Platform::Win64, Configuration::Development)
            .with_command_line("-dev -bulk")
            .with_required_flags(BuildFlags::LOOSE);
        assert_eq!(editor.effective_flags(), BuildFlags::LOOSE);
    }

    #[test]
    fn test_role_names() {
        let dummy = SessionRole::new(RoleType::Client, Platform::Linux, Configuration::Development)
            .with_modifier(RoleModifier::Dummy);
        assert_eq!(dummy.name(), "DummyClient");
        assert!(!dummy.is_null());
        assert_eq!(dummy.to_string(), "Linux Development DummyClient");
    }
}
