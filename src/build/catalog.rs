//! Build catalog
//!
//! Aggregates the registered [`BuildSource`]s and answers "which build should
//! this role run" queries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use super::{
    android::AndroidBuildSource, ios::IosBuildSource, staged::StagedBuildSource, Build,
    BuildFlags, BuildSource, Configuration, Platform, RoleType,
};
use crate::common::{Error, Result};

/// What a session asks the catalog for
#[derive(Debug, Clone)]
pub struct BuildQuery {
    pub platform: Platform,
    pub configuration: Configuration,
    pub role: RoleType,
    pub required_flags: BuildFlags,
}

impl std::fmt::Display for BuildQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.platform, self.configuration, self.role)?;
        if !self.required_flags.is_empty() {
            write!(f, " [{}]", self.required_flags)?;
        }
        Ok(())
    }
}

/// Registry of build sources
pub struct BuildCatalog {
    sources: Vec<Arc<dyn BuildSource>>,
}

impl Default for BuildCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildCatalog {
    /// Catalog with the built-in sources registered
    pub fn new() -> Self {
        Self {
            sources: vec![
                Arc::new(AndroidBuildSource),
                Arc::new(IosBuildSource),
                Arc::new(StagedBuildSource),
            ],
        }
    }

    /// Catalog with no sources
    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn register(&mut self, source: Arc<dyn BuildSource>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn BuildSource>] {
        &self.sources
    }

    /// Every build of `project` found under `root` by any source
    pub fn get_builds_at_path(&self, project: &str, root: &Path, max_recursion: usize) -> Vec<Build> {
        let mut builds = Vec::new();
        for source in &self.sources {
            let found = source.get_builds_at_path(project, root, max_recursion);
            tracing::debug!(
                "{} found {} build(s) under {}",
                source.build_name(),
                found.len(),
                root.display()
            );
            builds.extend(found);
        }
        builds
    }

    /// Builds for one platform, only asking sources that support it
    pub fn get_platform_builds(
        &self,
        project: &str,
        root: &Path,
        platform: Platform,
        max_recursion: usize,
    ) -> Vec<Build> {
        self.sources
            .iter()
            .filter(|s| s.can_support_platform(platform))
            .flat_map(|s| s.get_builds_at_path(project, root, max_recursion))
            .filter(|b| b.platform == platform)
            .collect()
    }

    /// Pick the build that best satisfies `query`
    ///
    /// Dedicated role builds win over shared ones.
    pub fn find_build(
        &self,
        project: &str,
        root: &Path,
        query: &BuildQuery,
        max_recursion: usize,
    ) -> Result<Build> {
        if !self
            .sources
            .iter()
            .any(|s| s.can_support_platform(query.platform))
        {
            return Err(Error::UnsupportedPlatform(query.platform));
        }

        let builds = self.get_platform_builds(project, root, query.platform, max_recursion);
        select_build(builds, query).ok_or_else(|| Error::NoMatchingBuild(query.to_string()))
    }
}

/// Choose among candidate builds
pub fn select_build(builds: Vec<Build>, query: &BuildQuery) -> Option<Build> {
    let mut matching: Vec<Build> = builds
        .into_iter()
        .filter(|b| {
            b.platform == query.platform
                && b.configuration == query.configuration
                && b.can_run_role(query.role)
                && b.has_flags(query.required_flags)
        })
        .collect();

    matching.sort_by_key(|b| b.shared);
    matching.into_iter().next()
}

/// Directories under `root` whose name starts with the platform's directory
/// prefix, searched at most `max_recursion` levels deep. `root` itself counts.
pub fn candidate_directories(root: &Path, platform: Platform, max_recursion: usize) -> Vec<PathBuf> {
    let prefix = platform.directory_prefix().to_ascii_lowercase();

    WalkDir::new(root)
        .max_depth(max_recursion)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable path while scanning for builds: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .starts_with(&prefix)
        })
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildArtifact;
    use std::fs;

    fn build(configuration: Configuration, role: RoleType, shared: bool) -> Build {
        Build {
            platform: Platform::Android,
            configuration,
            role,
            shared,
            flags: BuildFlags::PACKAGED,
            package_name: "com.epicgames.orion".into(),
            artifact: BuildArtifact::default(),
            source_dir: PathBuf::from("/builds/Android"),
            source: "test",
        }
    }

    #[test]
    fn test_select_prefers_dedicated_build() {
        let builds = vec![
            build(Configuration::Test, RoleType::Client, true),
            build(Configuration::Test, RoleType::Client, false),
            build(Configuration::Shipping, RoleType::Client, false),
        ];
        let query = BuildQuery {
            platform: Platform::Android,
            configuration: Configuration::Test,
            role: RoleType::Client,
            required_flags: BuildFlags::PACKAGED,
        };
        let chosen = select_build(builds, &query).unwrap();
        assert!(!chosen.shared);
        assert_eq!(chosen.configuration, Configuration::Test);
    }

    #[test]
    fn test_select_respects_required_flags() {
        let builds = vec![build(Configuration::Test, RoleType::Client, false)];
        let query = BuildQuery {
            platform: Platform::Android,
            configuration: Configuration::Test,
            role: RoleType::Client,
            required_flags: BuildFlags::BULK,
        };
        assert!(select_build(builds, &query).is_none());
    }

    #[test]
    fn test_candidate_directories_depth() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Android_ASTC")).unwrap();
        fs::create_dir_all(dir.path().join("CL-1234/Android_ETC2")).unwrap();
        fs::create_dir_all(dir.path().join("a/b/c/Android")).unwrap();
        fs::create_dir_all(dir.path().join("WindowsClient")).unwrap();

        let found = candidate_directories(dir.path(), Platform::Android, 2);
        assert_eq!(found.len(), 2);

        let windows = candidate_directories(dir.path(), Platform::Win64, 1);
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_find_build_unsupported_platform() {
        let catalog = BuildCatalog::empty();
        let query = BuildQuery {
            platform: Platform::Switch,
            configuration: Configuration::Test,
            role: RoleType::Client,
            required_flags: BuildFlags::empty(),
        };
        let err = catalog
            .find_build("OrionGame", Path::new("/nonexistent"), &query, 1)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform(Platform::Switch)));
    }
}
