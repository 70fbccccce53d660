//! Staged desktop builds
//!
//! A staged build is a directory tree (`WindowsClient/`, `LinuxServer/`, ...)
//! with executables under `<Project>/Binaries/<Platform>/`.

use std::path::Path;

use super::catalog::candidate_directories;
use super::naming::parse_build_name;
use super::{Build, BuildArtifact, BuildFlags, BuildSource, Platform};

/// Desktop platforms a staged build can target
const STAGED_PLATFORMS: &[Platform] = &[
    Platform::Win64,
    Platform::Win32,
    Platform::Mac,
    Platform::Linux,
];

/// Finds loose staged builds for desktop platforms
pub struct StagedBuildSource;

impl StagedBuildSource {
    fn builds_in_stage(&self, project: &str, stage: &Path, platform: Platform) -> Vec<Build> {
        let binaries = stage.join(project).join("Binaries").join(platform.name());
        let Ok(entries) = std::fs::read_dir(&binaries) else {
            return Vec::new();
        };

        let mut builds = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();

            let is_executable = match platform.executable_extension() {
                Some(ext) => path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case(ext))
                    .unwrap_or(false),
                None => path.is_file() && path.extension().is_none(),
            };
            if !is_executable {
                continue;
            }

            let Some(parsed) = parse_build_name(project, &file_name) else {
                tracing::debug!("Ignoring {} in {}", file_name, binaries.display());
                continue;
            };
            if parsed.platform.is_some_and(|p| p != platform) {
                continue;
            }

            let relative = Path::new(project)
                .join("Binaries")
                .join(platform.name())
                .join(&file_name);

            builds.push(Build {
                platform,
                configuration: parsed.configuration,
                role: parsed.role,
                shared: parsed.shared,
                flags: BuildFlags::LOOSE
                    | BuildFlags::CAN_REPLACE_COMMAND_LINE
                    | BuildFlags::CAN_REPLACE_EXECUTABLE
                    | parsed.flags(),
                package_name: relative.to_string_lossy().replace('\\', "/"),
                artifact: BuildArtifact {
                    package_path: stage.to_path_buf(),
                    files: Default::default(),
                },
                source_dir: stage.to_path_buf(),
                source: self.build_name(),
            });
        }
        builds
    }
}

impl BuildSource for StagedBuildSource {
    fn build_name(&self) -> &'static str {
        "StagedBuildSource"
    }

    fn can_support_platform(&self, platform: Platform) -> bool {
        STAGED_PLATFORMS.contains(&platform)
    }

    fn get_builds_at_path(&self, project: &str, path: &Path, max_recursion: usize) -> Vec<Build> {
        let mut builds = Vec::new();
        for &platform in STAGED_PLATFORMS {
            for stage in candidate_directories(path, platform, max_recursion) {
                builds.extend(self.builds_in_stage(project, &stage, platform));
            }
        }
        builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Configuration, RoleType};
    use std::fs;

    #[test]
    fn test_finds_linux_server() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("LinuxServer/OrionGame/Binaries/Linux");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("OrionServer-Linux-Test"), b"\x7fELF").unwrap();
        fs::write(bin.join("OrionServer-Linux-Test.debug"), b"").unwrap();
        fs::write(bin.join("libsteam_api.so"), b"").unwrap();

        let builds = StagedBuildSource.get_builds_at_path("OrionGame", dir.path(), 1);
        assert_eq!(builds.len(), 1);

        let build = &builds[0];
        assert_eq!(build.platform, Platform::Linux);
        assert_eq!(build.role, RoleType::Server);
        assert_eq!(build.configuration, Configuration::Test);
        assert!(build.has_flags(BuildFlags::LOOSE | BuildFlags::CAN_REPLACE_COMMAND_LINE));
        assert_eq!(
            build.package_name,
            "OrionGame/Binaries/Linux/OrionServer-Linux-Test"
        );
    }
}
