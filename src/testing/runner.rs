//! Test runner implementation
//!
//! Loads a scenario, turns each test into a session node, runs them through
//! the executor and checks the saved role logs against the expectations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::process::Command as TokioCommand;
use walkdir::WalkDir;

use crate::common::config::Config;
use crate::common::paths::sanitize_name;
use crate::common::{Error, Result};
use crate::context::RunContext;
use crate::device::FileToCopy;
use crate::log_parser::LogParser;
use crate::node::{ExecutorOptions, SessionTestNode, TestExecutor, TestNode, TestReport};
use crate::session::{RemoveArg, Session, SessionRole, SetArg};

use super::config::{ExpectedResult, RoleConfig, TestCase, TestExpectation, TestScenario};

const DEFAULT_TEST_TIMEOUT_SECS: u64 = 30 * 60;

/// Result of a scenario run
#[derive(Debug)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub tests_passed: usize,
    pub tests_total: usize,
    pub error: Option<String>,
}

/// Run a test scenario from a YAML file against the configured devices
pub async fn run_scenario(path: &Path, verbose: bool) -> Result<ScenarioResult> {
    let context = Arc::new(RunContext::new(Config::load()?)?);
    let result = run_scenario_with(context.clone(), path, verbose).await;
    if let Err(e) = context.shutdown().await {
        tracing::warn!("Failed to release devices: {}", e);
    }
    result
}

/// Load and parse a scenario file
pub fn load_scenario(path: &Path) -> Result<TestScenario> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read test scenario '{}': {}",
            path.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse test scenario: {}", e)))
}

/// Run a scenario with an existing context
pub async fn run_scenario_with(
    context: Arc<RunContext>,
    path: &Path,
    verbose: bool,
) -> Result<ScenarioResult> {
    let scenario = load_scenario(path)?;
    let tests_total = scenario.tests.len();

    println!(
        "\n{} {}",
        "Running Scenario:".blue().bold(),
        scenario.name.white().bold()
    );

    if let Some(desc) = &scenario.description {
        println!("  {}", desc.dimmed());
    }

    if let Some(setup_steps) = &scenario.setup {
        println!("\n{}", "Setup:".cyan());
        for step in setup_steps {
            if verbose {
                println!("  $ {}", step.shell.dimmed());
            }

            let status = TokioCommand::new("sh")
                .arg("-c")
                .arg(&step.shell)
                .stdin(Stdio::null())
                .stdout(if verbose { Stdio::inherit() } else { Stdio::null() })
                .stderr(if verbose { Stdio::inherit() } else { Stdio::null() })
                .status()
                .await
                .map_err(|e| Error::Config(format!("Setup command failed to execute: {}", e)))?;

            if !status.success() {
                return Ok(ScenarioResult {
                    name: scenario.name.clone(),
                    passed: false,
                    tests_passed: 0,
                    tests_total,
                    error: Some(format!(
                        "Setup command '{}' failed with exit code {:?}",
                        step.shell,
                        status.code()
                    )),
                });
            }
            println!("  {} {}", "✓".green(), step.shell.dimmed());
        }
    }

    let scenario_dir = path.parent().unwrap_or(Path::new("."));
    let build_root = resolve(scenario_dir, &scenario.target.build_root);
    let artifact_root = match &scenario.target.artifacts {
        Some(dir) => resolve(scenario_dir, dir),
        None => scenario_dir.join("artifacts").join(sanitize_name(&scenario.name)),
    };

    println!("\n{}", "Builds:".cyan());
    let builds = context.catalog.get_builds_at_path(
        &scenario.target.project,
        &build_root,
        scenario.target.max_depth,
    );
    if builds.is_empty() {
        let error = format!("No builds of {} found under {}", scenario.target.project, build_root.display());
        println!("  {} {}", "✗".red(), error);
        return Ok(ScenarioResult {
            name: scenario.name,
            passed: false,
            tests_passed: 0,
            tests_total,
            error: Some(error),
        });
    }
    for build in &builds {
        println!("  {} {}", "✓".green(), build.describe().dimmed());
    }

    let mut nodes: Vec<Box<dyn TestNode>> = Vec::with_capacity(tests_total);
    for test in &scenario.tests {
        let roles = test
            .roles
            .iter()
            .map(|role| build_role(role, scenario_dir))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::Config(format!("Test '{}': {}", test.name, e)))?;
        let session = Session::new(context.clone(), &scenario.target.project, &build_root, roles)
            .with_max_recursion(scenario.target.max_depth);
        let node = SessionTestNode::new(&test.name, session, test_artifact_dir(&artifact_root, test))
            .with_priority(test.priority.into())
            .with_max_duration(Duration::from_secs(test.timeout.unwrap_or(DEFAULT_TEST_TIMEOUT_SECS)));
        nodes.push(Box::new(node));
    }

    let mut options = ExecutorOptions::from_config(&context.services.config.executor);
    options.passes = scenario.target.passes.max(1);
    let executor = TestExecutor::new(options);

    println!("\n{}", "Tests:".cyan());
    let reports: HashMap<String, TestReport> = executor
        .execute(nodes)
        .await
        .into_iter()
        .map(|report| (report.name.clone(), report))
        .collect();

    let mut tests_passed = 0;
    let mut first_error = None;
    for test in &scenario.tests {
        let Some(report) = reports.get(&test.name) else {
            continue;
        };
        let dir = test_artifact_dir(&artifact_root, test);
        match check_test(test.expect.as_ref(), report, &dir) {
            Ok(()) => {
                tests_passed += 1;
                let note = if report.has_warnings { " (with warnings)" } else { "" };
                println!(
                    "  {} {}{} {}",
                    "✓".green(),
                    test.name,
                    note.yellow(),
                    format!("[{:.1}s]", report.duration.as_secs_f64()).dimmed()
                );
            }
            Err(e) => {
                println!("  {} {}: {}", "✗".red(), test.name, e);
                first_error.get_or_insert(format!("{}: {}", test.name, e));
            }
        }
        if verbose {
            for line in report.summary.lines().skip(1) {
                println!("    {}", line.trim().dimmed());
            }
        }
    }

    let passed = tests_passed == tests_total;
    if passed {
        println!("\n{} {}\n", "✓".green().bold(), "Scenario Passed".green().bold());
    } else {
        println!(
            "\n{} {}\n",
            "✗".red().bold(),
            format!("{} of {} test(s) failed", tests_total - tests_passed, tests_total)
                .red()
                .bold()
        );
    }
    println!("Artifacts: {}", artifact_root.display().to_string().dimmed());

    Ok(ScenarioResult {
        name: scenario.name,
        passed,
        tests_passed,
        tests_total,
        error: first_error,
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

fn test_artifact_dir(root: &Path, test: &TestCase) -> PathBuf {
    root.join(sanitize_name(&test.name))
}

/// Turn a scenario role into a session role
pub fn build_role(config: &RoleConfig, scenario_dir: &Path) -> Result<SessionRole> {
    let mut role = SessionRole::new(config.role_type, config.platform, config.configuration)
        .with_required_flags(config.required_flags().map_err(Error::Config)?);

    if let Some(args) = &config.args {
        role = role.with_command_line(args);
    }
    for name in &config.remove_args {
        role = role.with_option(RemoveArg(name.clone()));
    }
    for set in &config.set_args {
        role = role.with_option(SetArg {
            name: set.name.clone(),
            value: set.value.clone(),
        });
    }
    if let Some(modifier) = config.modifier {
        role = role.with_modifier(modifier);
    }
    if !config.files.is_empty() {
        role = role.with_files(
            config
                .files
                .iter()
                .map(|f| FileToCopy {
                    source: resolve(scenario_dir, &f.source),
                    directory: f.directory,
                    relative_path: f.path.clone(),
                })
                .collect(),
        );
    }
    Ok(role)
}

/// Saved output logs of the judged roles under `dir`
fn role_logs(dir: &Path) -> Vec<(String, LogParser)> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let role = file_name.strip_suffix("Output.log")?.to_string();
            if role.starts_with("Dummy") {
                return None;
            }
            match LogParser::from_file(entry.path()) {
                Ok(parser) => Some((role, parser)),
                Err(e) => {
                    tracing::warn!("{}", e);
                    None
                }
            }
        })
        .collect()
}

/// Check the executor verdict and the saved logs against a test's expectations
pub fn check_test(
    expect: Option<&TestExpectation>,
    report: &TestReport,
    artifact_dir: &Path,
) -> Result<()> {
    let default = TestExpectation::default();
    let expect = expect.unwrap_or(&default);

    let expected = expect.result.unwrap_or(ExpectedResult::Passed);
    let actual = if report.passed() {
        ExpectedResult::Passed
    } else {
        ExpectedResult::Failed
    };
    if expected != actual {
        let detail = report
            .error
            .clone()
            .or_else(|| report.summary.lines().last().map(|l| l.trim().to_string()))
            .unwrap_or_default();
        return Err(Error::TestAssertion(format!(
            "Expected test to be {:?}, got {} ({})",
            expected, report.result, detail
        )));
    }

    let needs_logs = expect.exit_code.is_some()
        || expect.max_errors.is_some()
        || expect.max_ensures.is_some()
        || expect.fatal_error.is_some()
        || expect.output_contains.is_some();
    if !needs_logs {
        return Ok(());
    }

    let logs = role_logs(artifact_dir);
    if logs.is_empty() {
        return Err(Error::TestAssertion(format!(
            "No role logs found under {}",
            artifact_dir.display()
        )));
    }

    if let Some(expected_code) = expect.exit_code {
        let codes: Vec<Option<i32>> = logs.iter().map(|(_, log)| log.test_exit_code()).collect();
        if !codes.contains(&Some(expected_code)) {
            return Err(Error::TestAssertion(format!(
                "Expected exit code {}, roles reported {:?}",
                expected_code, codes
            )));
        }
    }

    if let Some(max) = expect.max_errors {
        let errors: usize = logs.iter().map(|(_, log)| log.errors(None).len()).sum();
        if errors > max {
            return Err(Error::TestAssertion(format!(
                "Expected at most {} error(s), found {}",
                max, errors
            )));
        }
    }

    if let Some(max) = expect.max_ensures {
        let ensures: usize = logs.iter().map(|(_, log)| log.ensures().len()).sum();
        if ensures > max {
            return Err(Error::TestAssertion(format!(
                "Expected at most {} ensure(s), found {}",
                max, ensures
            )));
        }
    }

    if let Some(expected_fatal) = expect.fatal_error {
        let fatal = logs.iter().find_map(|(role, log)| {
            log.fatal_error().map(|f| format!("{}: {}", role, f.message))
        });
        match (expected_fatal, fatal) {
            (true, None) => {
                return Err(Error::TestAssertion("Expected a fatal error, found none".to_string()))
            }
            (false, Some(fatal)) => {
                return Err(Error::TestAssertion(format!("Unexpected fatal error in {}", fatal)))
            }
            _ => {}
        }
    }

    if let Some(needle) = &expect.output_contains {
        if !logs.iter().any(|(_, log)| log.content().contains(needle.as_str())) {
            return Err(Error::TestAssertion(format!(
                "Expected output containing '{}'",
                needle
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Configuration, Platform, RoleType};
    use crate::node::TestResult;
    use crate::session::testkit::{context, Lab};

    fn report(result: TestResult) -> TestReport {
        TestReport {
            name: "Boot".into(),
            result,
            passes_run: 1,
            retries: 0,
            timed_out: false,
            cancelled: false,
            has_warnings: false,
            duration: Duration::from_secs(3),
            error: None,
            summary: "Boot: failed\n  Client exited with code 3".into(),
        }
    }

    fn write_log(dir: &Path, role: &str, body: &str) {
        let role_dir = dir.join(role);
        std::fs::create_dir_all(&role_dir).unwrap();
        std::fs::write(role_dir.join(format!("{}Output.log", role)), body).unwrap();
    }

    #[test]
    fn test_result_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_test(None, &report(TestResult::Failed), dir.path()).unwrap_err();
        assert!(err.to_string().contains("Client exited with code 3"));

        let expect = TestExpectation {
            result: Some(ExpectedResult::Failed),
            ..Default::default()
        };
        assert!(check_test(Some(&expect), &report(TestResult::Failed), dir.path()).is_ok());
    }

    #[test]
    fn test_log_expectations() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "Client",
            "LogTemp: Error: texture missing\n\
             LogCore: Ensure condition failed: Hero\n\
             LogAutomation: *** TEST COMPLETE. EXIT CODE: 0 ***\n",
        );
        write_log(dir.path(), "DummyClient", "Fatal error: ignored\n");

        let passed = report(TestResult::Passed);
        let mut expect = TestExpectation {
            exit_code: Some(0),
            max_errors: Some(1),
            max_ensures: Some(1),
            fatal_error: Some(false),
            output_contains: Some("texture missing".into()),
            ..Default::default()
        };
        check_test(Some(&expect), &passed, dir.path()).unwrap();

        expect.max_ensures = Some(0);
        let err = check_test(Some(&expect), &passed, dir.path()).unwrap_err();
        assert!(err.to_string().contains("at most 0 ensure(s), found 1"));

        expect.max_ensures = None;
        expect.exit_code = Some(2);
        assert!(check_test(Some(&expect), &passed, dir.path()).is_err());
    }

    #[test]
    fn test_missing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let expect = TestExpectation {
            fatal_error: Some(true),
            ..Default::default()
        };
        let err = check_test(Some(&expect), &report(TestResult::Passed), dir.path()).unwrap_err();
        assert!(err.to_string().contains("No role logs"));
    }

    #[test]
    fn test_build_role() {
        let config: RoleConfig = serde_yaml::from_str(
            "{type: Client, platform: Android, configuration: Test, args: -fps, \
              remove_args: [nosplash], set_args: [{name: ResX, value: '1280'}], \
              flags: [bulk], modifier: Dummy}",
        )
        .unwrap();
        let role = build_role(&config, Path::new("/scenarios")).unwrap();
        assert_eq!(role.role_type, RoleType::Client);
        assert_eq!(role.platform, Platform::Android);
        assert_eq!(role.configuration, Configuration::Test);
        assert_eq!(role.options.len(), 2);
        assert!(role.is_dummy());
        assert!(role.command_line.contains("-fps"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scenario_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let ctx = context(dir.path(), &["pixel-1"], lab.clone());
        std::fs::create_dir_all(dir.path().join("builds")).unwrap();
        let scenario = dir.path().join("smoke.yaml");
        std::fs::write(
            &scenario,
            r#"
name: Smoke
target:
  project: OrionGame
  build_root: builds
tests:
  - name: Boot
    roles:
      - { type: Client, platform: Android, configuration: Test }
    expect:
      exit_code: 0
      fatal_error: false
"#,
        )
        .unwrap();

        let watcher = lab.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let first = watcher.instances.lock().unwrap().first().cloned();
                if let Some(instance) = first {
                    instance.print("*** TEST COMPLETE. EXIT CODE: 0 ***\n");
                    break;
                }
            }
        });

        let result = run_scenario_with(ctx, &scenario, false).await.unwrap();
        assert!(result.passed, "{:?}", result.error);
        assert_eq!(result.tests_passed, 1);
        assert!(dir
            .path()
            .join("artifacts/Smoke/Boot/Client/ClientOutput.log")
            .is_file());
    }
}
