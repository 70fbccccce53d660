//! Drives test nodes to completion

use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::{TestNode, TestResult, TestStatus};
use crate::common::config::ExecutorConfig;

/// How the executor runs tests
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub tick_interval: Duration,
    /// Tests in progress at once
    pub max_parallel: usize,
    /// Restarts allowed per pass for tests that ask for a retry or fail to
    /// start for a transient reason
    pub max_retries: u32,
    pub passes: u32,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            max_parallel: config.max_parallel_tests.max(1),
            max_retries: config.max_retries,
            passes: config.passes.max(1),
        }
    }
}

/// What happened to one test
#[derive(Debug, Clone)]
pub struct TestReport {
    pub name: String,
    pub result: TestResult,
    pub passes_run: u32,
    pub retries: u32,
    pub timed_out: bool,
    pub cancelled: bool,
    pub has_warnings: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub summary: String,
}

impl TestReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            result: TestResult::Invalid,
            passes_run: 0,
            retries: 0,
            timed_out: false,
            cancelled: false,
            has_warnings: false,
            duration: Duration::ZERO,
            error: None,
            summary: String::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.result == TestResult::Passed
    }
}

enum PassOutcome {
    Finished(TestResult),
    /// No further passes make sense
    Abandoned(TestResult),
}

/// Stops an executor from another task
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs a set of tests
pub struct TestExecutor {
    options: ExecutorOptions,
    cancel: CancelHandle,
}

impl TestExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every test and report on each, highest priority first
    pub async fn execute(&self, mut nodes: Vec<Box<dyn TestNode>>) -> Vec<TestReport> {
        nodes.sort_by_key(|n| n.priority());
        tracing::info!(
            "Running {} test(s), {} at a time, {} pass(es) each",
            nodes.len(),
            self.options.max_parallel,
            self.options.passes
        );

        stream::iter(nodes)
            .map(|node| self.run_node(node))
            .buffered(self.options.max_parallel)
            .collect()
            .await
    }

    async fn run_node(&self, mut node: Box<dyn TestNode>) -> TestReport {
        let started = Instant::now();
        let mut report = TestReport::new(node.name());
        let passes = self.options.passes;
        let mut overall = TestResult::Passed;

        for pass in 0..passes {
            let (result, abandon) = match self.run_pass(node.as_mut(), pass, passes, &mut report).await {
                PassOutcome::Finished(result) => (result, false),
                PassOutcome::Abandoned(result) => (result, true),
            };
            report.passes_run += 1;
            report.has_warnings |= node.has_warnings();
            tracing::info!(
                "{} pass {}/{}: {}",
                report.name,
                pass + 1,
                passes,
                result
            );
            if overall == TestResult::Passed && result != TestResult::Passed {
                overall = result;
            }
            if abandon || report.cancelled {
                break;
            }
        }

        report.result = overall;
        report.duration = started.elapsed();
        report.summary = node.test_summary();
        report
    }

    async fn run_pass(
        &self,
        node: &mut dyn TestNode,
        pass: u32,
        passes: u32,
        report: &mut TestReport,
    ) -> PassOutcome {
        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                return PassOutcome::Abandoned(TestResult::Invalid);
            }
            match node.is_ready_to_start().await {
                Ok(true) => break,
                Ok(false) => tokio::time::sleep(self.options.tick_interval).await,
                Err(e) => {
                    tracing::error!("{} can never start: {}", report.name, e);
                    report.error = Some(format!("never ready: {}", e));
                    return PassOutcome::Abandoned(TestResult::Failed);
                }
            }
        }

        let mut retries_left = self.options.max_retries;
        tracing::info!("Starting {} (pass {}/{})", report.name, pass + 1, passes);
        let mut started = node.start_test(pass, passes).await;

        loop {
            if let Err(e) = started {
                node.cleanup_test().await;
                if e.is_retryable() && retries_left > 0 && !self.cancel.is_cancelled() {
                    retries_left -= 1;
                    report.retries += 1;
                    tracing::warn!("{} failed to start ({}), retrying", report.name, e);
                    started = node.start_test(pass, passes).await;
                    continue;
                }
                tracing::error!("{} failed to start: {}", report.name, e);
                report.error = Some(e.to_string());
                return PassOutcome::Finished(TestResult::Failed);
            }

            self.tick_until_complete(node, report).await;
            let result = node.result();

            if result == TestResult::WantRetry && retries_left > 0 && !self.cancel.is_cancelled() {
                retries_left -= 1;
                report.retries += 1;
                tracing::warn!("{} asked for a retry", report.name);
                // restart_test cleans up the finished run itself
                started = node.restart_test().await;
                continue;
            }

            node.cleanup_test().await;
            return PassOutcome::Finished(match result {
                TestResult::WantRetry => {
                    report.error.get_or_insert_with(|| "retry budget exhausted".to_string());
                    TestResult::Failed
                }
                TestResult::Invalid => {
                    report.error.get_or_insert_with(|| "test completed without a result".to_string());
                    TestResult::Failed
                }
                other => other,
            });
        }
    }

    async fn tick_until_complete(&self, node: &mut dyn TestNode, report: &mut TestReport) {
        let started = Instant::now();
        let max_duration = node.max_duration();
        let mut ticker = tokio::time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if node.status() == TestStatus::Complete {
                return;
            }
            if self.cancel.is_cancelled() {
                tracing::warn!("{} cancelled", report.name);
                report.cancelled = true;
                node.stop_test(true).await;
                return;
            }
            if started.elapsed() > max_duration {
                tracing::warn!(
                    "{} exceeded its maximum duration of {}s, stopping",
                    report.name,
                    max_duration.as_secs()
                );
                report.timed_out = true;
                node.stop_test(true).await;
                return;
            }
            node.tick_test().await;
        }
    }
}
