//! Build filename conventions
//!
//! Executables and packages are named
//! `{ProjectShortName}{Role?}{-Platform-Config}?{ext}`, e.g.
//! `FortniteClient-Win64-Test.exe`. The platform/configuration suffix is
//! omitted for Development builds, and a missing role (or the generic `Game`
//! token) marks a shared build.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{BuildFlags, Configuration, Platform, RoleType};

/// Prefix used by builds without project code
const CONTENT_ONLY_PREFIX: &str = "UE4";

static GAME_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)game").expect("static regex"));

/// Project name with the `Game` token removed (`FortniteGame` -> `Fortnite`)
pub fn short_project_name(project: &str) -> String {
    GAME_TOKEN.replace_all(project, "").into_owned()
}

/// The components of a build filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildName {
    /// Prefix the name actually used (project short name or `UE4`)
    pub prefix: String,
    pub role: RoleType,
    /// Role token as written: empty, `Game`, or the role name
    pub role_token: String,
    pub shared: bool,
    pub platform: Option<Platform>,
    pub configuration: Configuration,
    /// Whether the name carried a configuration suffix
    pub explicit_configuration: bool,
    pub content_only: bool,
    /// Extension including the dot, or empty
    pub extension: String,
}

impl BuildName {
    /// Flags implied by the name alone
    pub fn flags(&self) -> BuildFlags {
        if self.content_only {
            BuildFlags::CONTENT_ONLY
        } else {
            BuildFlags::empty()
        }
    }

    /// Rebuild the filename this name was parsed from
    pub fn to_filename(&self) -> String {
        let mut name = format!("{}{}", self.prefix, self.role_token);
        if let Some(platform) = self.platform {
            name.push_str(&format!("-{}", platform));
        }
        if self.explicit_configuration {
            name.push_str(&format!("-{}", self.configuration));
        }
        name.push_str(&self.extension);
        name
    }
}

/// Canonical filename for a build of `project`
pub fn build_filename(
    project: &str,
    role: RoleType,
    shared: bool,
    platform: Option<Platform>,
    configuration: Configuration,
    extension: &str,
) -> String {
    compose(
        &short_project_name(project),
        role,
        shared,
        platform,
        configuration,
        extension,
    )
}

fn compose(
    prefix: &str,
    role: RoleType,
    shared: bool,
    platform: Option<Platform>,
    configuration: Configuration,
    extension: &str,
) -> String {
    let role_token = if shared && role == RoleType::Client {
        "Game"
    } else {
        role.name()
    };

    let mut name = format!("{}{}", prefix, role_token);
    if configuration != Configuration::Development {
        if let Some(platform) = platform {
            name.push_str(&format!("-{}-{}", platform, configuration));
        }
    }
    name.push_str(&normalize_extension(extension));
    name
}

/// Ensure a non-empty extension starts with a dot
pub fn normalize_extension(extension: &str) -> String {
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    }
}

/// Parse a build filename for `project`.
///
/// Returns `None` when the name does not belong to the project or carries an
/// unknown role, platform or configuration token.
pub fn parse_build_name(project: &str, filename: &str) -> Option<BuildName> {
    let (stem, extension) = match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    };

    let mut tokens = stem.split('-');
    let head = tokens.next()?;

    let short = short_project_name(project);
    let (prefix, content_only) = if starts_with_ignore_case(head, &short) {
        (&head[..short.len()], false)
    } else if starts_with_ignore_case(head, CONTENT_ONLY_PREFIX) {
        (&head[..CONTENT_ONLY_PREFIX.len()], true)
    } else {
        return None;
    };

    let role_token = &head[prefix.len()..];
    let (role, shared) = parse_role_token(role_token)?;

    let platform = match tokens.next() {
        Some(token) => Some(Platform::from_name(token)?),
        None => None,
    };
    let (configuration, explicit_configuration) = match tokens.next() {
        Some(token) => (Configuration::from_name(token)?, true),
        None => (Configuration::Development, false),
    };

    Some(BuildName {
        prefix: prefix.to_string(),
        role,
        role_token: role_token.to_string(),
        shared,
        platform,
        configuration,
        explicit_configuration,
        content_only,
        extension: extension.to_string(),
    })
}

fn parse_role_token(token: &str) -> Option<(RoleType, bool)> {
    if token.is_empty() || token.eq_ignore_ascii_case("Game") {
        return Some((RoleType::Client, true));
    }
    match RoleType::from_name(token)? {
        role @ (RoleType::Client | RoleType::Server | RoleType::Editor) => Some((role, false)),
        _ => None,
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    !prefix.is_empty()
        && text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_project_name() {
        assert_eq!(short_project_name("FortniteGame"), "Fortnite");
        assert_eq!(short_project_name("ShooterGAME"), "Shooter");
        assert_eq!(short_project_name("Orion"), "Orion");
    }

    #[test]
    fn test_parse_client_test_build() {
        let name = parse_build_name("FortniteGame", "FortniteClient-Win64-Test.exe").unwrap();
        assert_eq!(name.configuration, Configuration::Test);
        assert_eq!(name.platform, Some(Platform::Win64));
        assert_eq!(name.role, RoleType::Client);
        assert!(!name.shared);
        assert_eq!(name.extension, ".exe");
    }

    #[test]
    fn test_parse_development_shared() {
        let name = parse_build_name("FortniteGame", "FortniteGame.exe").unwrap();
        assert_eq!(name.configuration, Configuration::Development);
        assert_eq!(name.platform, None);
        assert_eq!(name.role, RoleType::Client);
        assert!(name.shared);

        let bare = parse_build_name("FortniteGame", "Fortnite").unwrap();
        assert!(bare.shared);
        assert_eq!(bare.extension, "");
    }

    #[test]
    fn test_parse_server_and_editor() {
        let server = parse_build_name("OrionGame", "OrionServer-Linux-Shipping").unwrap();
        assert_eq!(server.role, RoleType::Server);
        assert_eq!(server.platform, Some(Platform::Linux));
        assert_eq!(server.configuration, Configuration::Shipping);

        let editor = parse_build_name("OrionGame", "OrionEditor-Win64-DebugGame.exe").unwrap();
        assert_eq!(editor.role, RoleType::Editor);
        assert_eq!(editor.configuration, Configuration::DebugGame);
    }

    #[test]
    fn test_content_only() {
        let name = parse_build_name("ContentDemo", "UE4Game-Android-Test.apk").unwrap();
        assert!(name.content_only);
        assert!(name.flags().contains(BuildFlags::CONTENT_ONLY));
        assert!(name.shared);
    }

    #[test]
    fn test_rejects_foreign_names() {
        assert!(parse_build_name("FortniteGame", "ShooterClient-Win64-Test.exe").is_none());
        assert!(parse_build_name("FortniteGame", "FortniteClient-Amiga-Test.exe").is_none());
        assert!(parse_build_name("FortniteGame", "FortniteClient-Win64-Fast.exe").is_none());
        assert!(parse_build_name("FortniteGame", "FortniteEditorGame.exe").is_none());
    }

    #[test]
    fn test_round_trip_real_names() {
        let fixtures = [
            ("FortniteGame", "FortniteClient-Win64-Test.exe"),
            ("FortniteGame", "FortniteGame-Win64-Shipping.exe"),
            ("FortniteGame", "FortniteServer.exe"),
            ("OrionGame", "OrionClient-Android-Test.apk"),
            ("OrionGame", "OrionServer-Linux-Debug"),
            ("ShooterGame", "shooterclient-ios-shipping.ipa"),
            ("FortniteGame", "Fortnite-Win64-Test.exe"),
            ("FortniteGame", "FortniteClient-Win64.exe"),
            ("OrionGame", "Orion.apk"),
            ("OrionGame", "OrionGame-Android-Development.apk"),
        ];
        for (project, filename) in fixtures {
            let parsed = parse_build_name(project, filename).unwrap();
            assert!(
                parsed.to_filename().eq_ignore_ascii_case(filename),
                "{} -> {}",
                filename,
                parsed.to_filename()
            );
        }
    }

    #[test]
    fn test_build_filename() {
        assert_eq!(
            build_filename(
                "FortniteGame",
                RoleType::Client,
                false,
                Some(Platform::Win64),
                Configuration::Test,
                "exe"
            ),
            "FortniteClient-Win64-Test.exe"
        );
        assert_eq!(
            build_filename(
                "FortniteGame",
                RoleType::Server,
                false,
                Some(Platform::Linux),
                Configuration::Development,
                ""
            ),
            "FortniteServer"
        );
    }
}
