//! YAML scenario runner
//!
//! A scenario names a project, where its builds live and a list of tests.
//! Each test becomes a [`SessionTestNode`](crate::node::SessionTestNode);
//! after the executor has run them, the saved role logs are checked against
//! the test's expectations.

mod config;
mod runner;

pub use config::*;
pub use runner::{build_role, check_test, load_scenario, run_scenario, run_scenario_with, ScenarioResult};
