//! Test nodes and the executor that drives them
//!
//! A [`TestNode`] is one test. The [`TestExecutor`] waits until a node is
//! ready, starts it, ticks it at a fixed cadence until it completes (or runs
//! out of time), retries it when it asks for a retry and cleans it up exactly
//! once per start.
//!
//! ```text
//! NotStarted -> InProgress -> Complete
//! ```

pub mod executor;
pub mod session_node;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::common::Result;

pub use executor::{ExecutorOptions, TestExecutor, TestReport};
pub use session_node::SessionTestNode;

/// Where a test is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

/// Outcome of a test. Only meaningful once the test is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestResult {
    #[default]
    Invalid,
    Passed,
    Failed,
    /// Something outside the test went wrong; running it again may pass
    WantRetry,
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestResult::Invalid => write!(f, "invalid"),
            TestResult::Passed => write!(f, "passed"),
            TestResult::Failed => write!(f, "failed"),
            TestResult::WantRetry => write!(f, "want retry"),
        }
    }
}

/// Order tests start in; critical first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Idle,
}

/// One test
///
/// `tick_test` is called at a fixed cadence and must never block: anything
/// slow it depends on (process liveness, remote logs) is throttled and cached
/// by the device layer.
#[async_trait]
pub trait TestNode: Send {
    fn name(&self) -> &str;

    fn priority(&self) -> TestPriority {
        TestPriority::Normal
    }

    /// The executor stops the test once it has been running this long
    fn max_duration(&self) -> Duration;

    fn status(&self) -> TestStatus;

    fn result(&self) -> TestResult;

    fn has_warnings(&self) -> bool {
        false
    }

    /// `Ok(false)` means not yet. An error means the test can never start.
    async fn is_ready_to_start(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Start pass `pass` of `num_passes`. The test is in progress only if
    /// this succeeds.
    async fn start_test(&mut self, pass: u32, num_passes: u32) -> Result<()>;

    async fn tick_test(&mut self);

    /// Stop and work out the result. `was_cancelled` is set when the test is
    /// stopped from outside (timeout or cancellation).
    async fn stop_test(&mut self, was_cancelled: bool);

    /// Release everything `start_test` acquired
    async fn cleanup_test(&mut self);

    /// Run again after a `WantRetry` result
    async fn restart_test(&mut self) -> Result<()> {
        self.cleanup_test().await;
        self.start_test(0, 1).await
    }

    /// Human readable outcome, shown in reports
    fn test_summary(&self) -> String {
        format!("{}: {}", self.name(), self.result())
    }
}
