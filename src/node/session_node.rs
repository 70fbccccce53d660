//! A test node that runs one session

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{TestNode, TestPriority, TestResult, TestStatus};
use crate::common::Result;
use crate::log_parser::LogParser;
use crate::session::{save_session_artifacts, RoleArtifacts, Session, SessionInstance};

/// Launches a session, watches it until a verdict is possible, then saves
/// every role's artifacts and judges the run from the logs
pub struct SessionTestNode {
    name: String,
    priority: TestPriority,
    max_duration: Duration,
    session: Session,
    artifact_root: PathBuf,
    status: TestStatus,
    result: TestResult,
    has_warnings: bool,
    pass: u32,
    num_passes: u32,
    instance: Option<Arc<SessionInstance>>,
    artifacts: Vec<RoleArtifacts>,
    failures: Vec<String>,
}

impl SessionTestNode {
    pub fn new(name: &str, session: Session, artifact_root: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            priority: TestPriority::Normal,
            max_duration: Duration::from_secs(30 * 60),
            session,
            artifact_root,
            status: TestStatus::NotStarted,
            result: TestResult::Invalid,
            has_warnings: false,
            pass: 0,
            num_passes: 1,
            instance: None,
            artifacts: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Artifacts saved by the last stop
    pub fn artifacts(&self) -> &[RoleArtifacts] {
        &self.artifacts
    }

    /// Why the last run did not pass
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    fn artifact_dir(&self) -> PathBuf {
        if self.num_passes > 1 {
            self.artifact_root.join(format!("Pass{}", self.pass + 1))
        } else {
            self.artifact_root.clone()
        }
    }

    /// Whether a role has printed its test exit code yet
    async fn completion_reported(instance: &SessionInstance) -> bool {
        for role in instance.running_roles() {
            if role.role.is_dummy() {
                continue;
            }
            let output = role.instance.std_out().await;
            if LogParser::new(&output).test_exit_code().is_some() {
                return true;
            }
        }
        false
    }

    async fn judge(&mut self, was_cancelled: bool) -> TestResult {
        let mut failures = Vec::new();
        let mut retry_reasons = Vec::new();
        let mut completed = false;

        for artifact in &self.artifacts {
            if artifact.role.is_dummy() {
                continue;
            }
            let role = artifact.role.name();
            let summary = artifact.log_parser.summary();
            if !summary.ensures.is_empty() {
                self.has_warnings = true;
            }

            if let Some(fatal) = &summary.fatal_error {
                failures.push(format!("{} hit a fatal error: {}", role, fatal.message));
                continue;
            }

            match summary.test_exit_code {
                Some(0) => completed = true,
                Some(code) => failures.push(format!("{} reported exit code {}", role, code)),
                None if artifact.instance.was_killed() => {
                    if was_cancelled {
                        failures.push(format!("{} was stopped before it finished", role));
                    }
                }
                None if artifact.log_parser.content().trim().is_empty() => {
                    retry_reasons.push(format!("{} exited without any output", role));
                }
                None => match artifact.instance.exit_code().await {
                    Some(0) | None => {}
                    Some(code) => failures.push(format!("{} exited with code {}", role, code)),
                },
            }
        }

        let result = if !failures.is_empty() {
            TestResult::Failed
        } else if !retry_reasons.is_empty() {
            failures = retry_reasons;
            TestResult::WantRetry
        } else if completed || !was_cancelled {
            TestResult::Passed
        } else {
            failures.push("stopped before any role reported completion".to_string());
            TestResult::Failed
        };
        self.failures = failures;
        result
    }
}

#[async_trait]
impl TestNode for SessionTestNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> TestPriority {
        self.priority
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    fn status(&self) -> TestStatus {
        self.status
    }

    fn result(&self) -> TestResult {
        self.result
    }

    fn has_warnings(&self) -> bool {
        self.has_warnings
    }

    /// A session whose roles can never be satisfied never becomes ready
    async fn is_ready_to_start(&mut self) -> Result<bool> {
        self.session.resolve_builds()?;
        Ok(true)
    }

    async fn start_test(&mut self, pass: u32, num_passes: u32) -> Result<()> {
        self.pass = pass;
        self.num_passes = num_passes.max(1);
        self.status = TestStatus::NotStarted;
        self.result = TestResult::Invalid;
        self.artifacts.clear();
        self.failures.clear();

        let instance = self.session.launch_session().await?;
        self.instance = Some(instance);
        self.status = TestStatus::InProgress;
        tracing::info!("{} started", self.name);
        Ok(())
    }

    async fn tick_test(&mut self) {
        if self.status != TestStatus::InProgress {
            return;
        }
        let Some(instance) = self.instance.clone() else {
            return;
        };

        if !instance.is_running_roles().await {
            tracing::info!("{}: a role exited", self.name);
            self.stop_test(false).await;
        } else if Self::completion_reported(&instance).await {
            tracing::info!("{}: completion reported", self.name);
            self.stop_test(false).await;
        }
    }

    async fn stop_test(&mut self, was_cancelled: bool) {
        if self.status == TestStatus::Complete {
            return;
        }
        let Some(instance) = self.instance.clone() else {
            self.result = TestResult::Failed;
            self.status = TestStatus::Complete;
            return;
        };

        if let Err(e) = instance.shutdown().await {
            tracing::warn!("{}: failed to stop every role: {}", self.name, e);
        }

        let dir = self.artifact_dir();
        match save_session_artifacts(&instance, &dir).await {
            Ok(artifacts) => self.artifacts = artifacts,
            Err(e) => tracing::warn!("{}: failed to save artifacts to {}: {}", self.name, dir.display(), e),
        }

        self.result = self.judge(was_cancelled).await;
        self.status = TestStatus::Complete;
        tracing::info!("{} finished: {}", self.name, self.result);
        for failure in &self.failures {
            tracing::info!("  {}", failure);
        }
    }

    async fn cleanup_test(&mut self) {
        self.instance = None;
        if let Err(e) = self.session.shutdown_session().await {
            tracing::warn!("{}: cleanup failed: {}", self.name, e);
        }
    }

    fn test_summary(&self) -> String {
        let mut summary = format!("{}: {}", self.name, self.result);
        for artifact in &self.artifacts {
            let logs = artifact.log_parser.summary();
            summary.push_str(&format!(
                "\n  {}: {} error(s), {} warning(s), {} ensure(s){}",
                artifact.role.name(),
                logs.errors.len(),
                logs.warnings.len(),
                logs.ensures.len(),
                if logs.has_fatal_error() { ", fatal error" } else { "" }
            ));
        }
        for failure in &self.failures {
            summary.push_str(&format!("\n  {}", failure));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Configuration, Platform, RoleType};
    use crate::device::AppInstance;
    use crate::node::{ExecutorOptions, TestExecutor};
    use crate::session::testkit::{context, Lab};
    use crate::session::{RoleModifier, SessionRole};
    use std::path::Path;

    fn client() -> SessionRole {
        SessionRole::new(RoleType::Client, Platform::Android, Configuration::Test)
    }

    fn node(dir: &Path, lab: &Arc<Lab>, devices: &[&str], roles: Vec<SessionRole>) -> SessionTestNode {
        let ctx = context(dir, devices, lab.clone());
        let session = Session::new(ctx, "OrionGame", dir, roles);
        SessionTestNode::new("BootTest", session, dir.join("artifacts"))
    }

    #[tokio::test]
    async fn test_passes_once_completion_reported() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let mut node = node(dir.path(), &lab, &["pixel-1"], vec![client()]);

        node.start_test(0, 1).await.unwrap();
        assert_eq!(node.status(), TestStatus::InProgress);
        let instance = lab.instances.lock().unwrap()[0].clone();

        instance.print("LogInit: Build Configuration: Test\n");
        node.tick_test().await;
        assert_eq!(node.status(), TestStatus::InProgress);

        instance.print("LogAutomation: *** TEST COMPLETE. EXIT CODE: 0 ***\n");
        node.tick_test().await;
        assert_eq!(node.status(), TestStatus::Complete);
        assert_eq!(node.result(), TestResult::Passed);
        assert!(instance.was_killed());
        assert!(dir.path().join("artifacts/Client/ClientOutput.log").is_file());

        node.cleanup_test().await;
    }

    #[tokio::test]
    async fn test_fatal_error_fails() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let mut node = node(dir.path(), &lab, &["pixel-1"], vec![client()]);

        node.start_test(0, 1).await.unwrap();
        let instance = lab.instances.lock().unwrap()[0].clone();
        instance.print(
            "LogWindows: Error: Fatal error: [File:Hero.cpp] [Line: 3] Null hero\n\
             [Callstack] 0x00007ff6 OrionGame!AHero::Tick() [Hero.cpp:3]\n\
             LogCore: Ensure condition failed: Hero\n",
        );
        instance.exit(3);

        node.tick_test().await;
        assert_eq!(node.result(), TestResult::Failed);
        assert!(node.has_warnings());
        assert!(node.failures()[0].contains("Null hero"));
        assert!(node.test_summary().contains("fatal error"));
    }

    #[tokio::test]
    async fn test_silent_exit_wants_retry() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let mut node = node(dir.path(), &lab, &["pixel-1"], vec![client()]);

        node.start_test(0, 1).await.unwrap();
        lab.instances.lock().unwrap()[0].exit(0);
        node.tick_test().await;
        assert_eq!(node.result(), TestResult::WantRetry);
    }

    #[tokio::test]
    async fn test_forced_stop_after_completion_still_passes() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let mut node = node(
            dir.path(),
            &lab,
            &["pixel-1", "pixel-2"],
            vec![client(), client().with_modifier(RoleModifier::Dummy)],
        );

        node.start_test(0, 1).await.unwrap();
        let instances = lab.instances.lock().unwrap().clone();
        instances[0].print("*** TEST COMPLETE. EXIT CODE: 0 ***\n");
        node.stop_test(true).await;
        assert_eq!(node.result(), TestResult::Passed);
        assert!(dir.path().join("artifacts/DummyClient/DummyClientOutput.log").is_file());

        let mut hung = self::node(dir.path(), &Arc::new(Lab::default()), &["pixel-3"], vec![client()]);
        hung.start_test(0, 1).await.unwrap();
        hung.stop_test(true).await;
        assert_eq!(hung.result(), TestResult::Failed);
    }

    #[tokio::test]
    async fn test_unsatisfiable_session_never_ready() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let mut node = node(
            dir.path(),
            &lab,
            &["pixel-1"],
            vec![SessionRole::new(RoleType::Editor, Platform::Android, Configuration::Test)],
        );
        assert!(node.is_ready_to_start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_under_executor() {
        let dir = tempfile::tempdir().unwrap();
        let lab = Arc::new(Lab::default());
        let node = node(dir.path(), &lab, &["pixel-1"], vec![client()]);

        let watcher = lab.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let instance = watcher.instances.lock().unwrap()[0].clone();
            instance.print("*** TEST COMPLETE. EXIT CODE: 0 ***\n");
        });

        let executor = TestExecutor::new(ExecutorOptions {
            tick_interval: Duration::from_secs(1),
            max_parallel: 1,
            max_retries: 0,
            passes: 1,
        });
        let reports = executor.execute(vec![Box::new(node)]).await;
        assert!(reports[0].passed(), "{}", reports[0].summary);
        assert!(reports[0].summary.starts_with("BootTest: passed"));
    }
}
