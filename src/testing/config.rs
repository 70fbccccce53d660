//! Test scenario configuration types
//!
//! Defines the data structures for deserializing YAML test scenarios.

use serde::Deserialize;
use std::path::PathBuf;

use crate::build::{BuildFlags, Configuration, Platform, RoleType};
use crate::device::LogicalDirectory;
use crate::node::TestPriority;
use crate::session::RoleModifier;

/// A complete test scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct TestScenario {
    /// Name of the test scenario
    pub name: String,
    /// Optional description of what the scenario verifies
    pub description: Option<String>,
    /// Optional setup steps to run before the tests (e.g., staging builds)
    pub setup: Option<Vec<SetupStep>>,
    /// Project and builds the tests run
    pub target: TargetConfig,
    /// Tests to run, each in its own session
    pub tests: Vec<TestCase>,
}

/// A setup step that runs before the tests
#[derive(Deserialize, Debug)]
pub struct SetupStep {
    /// Shell command to execute
    pub shell: String,
}

/// Where the builds come from
#[derive(Deserialize, Debug)]
pub struct TargetConfig {
    /// Project name, as used in build and package names
    pub project: String,
    /// Directory searched for builds, relative to the scenario file
    pub build_root: PathBuf,
    /// How deep below `build_root` to look
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Where artifacts are written, relative to the scenario file
    pub artifacts: Option<PathBuf>,
    /// Run every test this many times
    #[serde(default = "default_passes")]
    pub passes: u32,
}

fn default_max_depth() -> usize {
    crate::session::DEFAULT_MAX_RECURSION
}

fn default_passes() -> u32 {
    1
}

/// One test: a session of roles and what its logs must show
#[derive(Deserialize, Debug)]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    /// Maximum run time in seconds (default: 1800)
    pub timeout: Option<u64>,
    pub roles: Vec<RoleConfig>,
    pub expect: Option<TestExpectation>,
}

/// Scenario spelling of [`TestPriority`]
#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Idle,
}

impl From<Priority> for TestPriority {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Critical => TestPriority::Critical,
            Priority::High => TestPriority::High,
            Priority::Normal => TestPriority::Normal,
            Priority::Low => TestPriority::Low,
            Priority::Idle => TestPriority::Idle,
        }
    }
}

/// A role in the test's session
#[derive(Deserialize, Debug)]
pub struct RoleConfig {
    #[serde(rename = "type")]
    pub role_type: RoleType,
    pub platform: Platform,
    #[serde(default)]
    pub configuration: Configuration,
    /// Extra arguments appended to the command line
    pub args: Option<String>,
    /// Arguments removed from the composed command line
    #[serde(default)]
    pub remove_args: Vec<String>,
    /// `-name=value` arguments set on the composed command line
    #[serde(default)]
    pub set_args: Vec<SetArgConfig>,
    /// Build flags the role's build must have (e.g. "bulk", "packaged")
    #[serde(default)]
    pub flags: Vec<String>,
    pub modifier: Option<RoleModifier>,
    /// Files copied next to the install
    #[serde(default)]
    pub files: Vec<FileConfig>,
}

impl RoleConfig {
    /// The required flags, or the first name that is not a build flag
    pub fn required_flags(&self) -> Result<BuildFlags, String> {
        self.flags.iter().try_fold(BuildFlags::empty(), |flags, name| {
            let normalized = name.trim().to_ascii_uppercase().replace(['-', ' '], "_");
            BuildFlags::from_name(&normalized)
                .map(|flag| flags | flag)
                .ok_or_else(|| format!("unknown build flag '{}'", name))
        })
    }
}

#[derive(Deserialize, Debug)]
pub struct SetArgConfig {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Debug)]
pub struct FileConfig {
    /// Local file, relative to the scenario file
    pub source: PathBuf,
    pub directory: LogicalDirectory,
    pub path: String,
}

/// What the saved role logs must show once the test has run
#[derive(Deserialize, Debug, Default)]
pub struct TestExpectation {
    /// Expected executor verdict (default: passed)
    pub result: Option<ExpectedResult>,
    /// Exit code reported in the test completion marker
    pub exit_code: Option<i32>,
    /// Upper bound on `Error:` lines across roles
    pub max_errors: Option<usize>,
    /// Upper bound on ensures across roles
    pub max_ensures: Option<usize>,
    /// Whether a fatal error is expected
    pub fatal_error: Option<bool>,
    /// Substring that must appear in some role's output
    pub output_contains: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedResult {
    Passed,
    Failed,
}
