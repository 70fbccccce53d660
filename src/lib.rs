//! devicelab - device test orchestration
//!
//! Discovers builds on disk, deploys them to devices through the platform
//! bridge tools, runs multi-role sessions under a ticking test executor and
//! judges the results from the application logs.

pub mod build;
pub mod cli;
pub mod commands;
pub mod common;
pub mod context;
pub mod device;
pub mod log_parser;
pub mod node;
pub mod process;
pub mod session;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, ErrorKind, Result};
pub use log_parser::LogParser;
