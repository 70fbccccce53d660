//! Log analysis
//!
//! [`LogParser`] wraps the text an application printed and answers questions
//! about it: which warnings and errors were logged on which channel, whether
//! the application hit a fatal error or an ensure (with callstacks), how it
//! exited, and what build and hardware it ran on. The buffer never changes
//! once wrapped, so the full [`LogSummary`] is computed on first use and kept.

mod callstack;

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::path::Path;

use crate::common::{normalize_newlines, Error, Result};

pub use callstack::{extract_callstacks, CallstackMessage, TraceKind};

static CHANNEL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[[^\]]*\]\[\s*\d+\])?Log(\w+):\s*(.*)$").expect("static regex")
});

static TEST_COMPLETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"TEST COMPLETE\. EXIT CODE:\s*(-?\d+)").expect("static regex")
});

static REQUEST_EXIT_WITH_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"RequestExitWithStatus\(\s*\w+\s*,\s*(-?\d+)\s*\)").expect("static regex")
});

static EXIT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"F\w+::RequestExit|Engine exit requested").expect("static regex")
});

static ERROR_SHUTDOWN_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"=== Critical error: ===|appError called|Exiting abnormally").expect("static regex")
});

static BUILD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LogInit:\s*Build:\s*(\S+)").expect("static regex"));
static BRANCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LogInit:\s*Branch Name:\s*(\S+)").expect("static regex"));
static CHANGELIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LogInit:.*CL-(\d+)").expect("static regex"));
static BUILD_CONFIGURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LogInit:\s*Build Configuration:\s*(\w+)").expect("static regex"));
static PLATFORM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"LogInit:\s*OS:\s*(.+?),\s*CPU:\s*(.+?),\s*GPU:\s*(.+)$").expect("static regex")
});

/// Printed by some perf tests in place of an exit code; treated as success
const HEURISTIC_SUCCESS_MARKER: &str = "EnvironmentalPerfTest summary";

/// What the application reported about its build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub build_name: String,
    pub branch: String,
    pub changelist: u32,
    pub configuration: String,
}

/// What the application reported about the hardware it ran on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: String,
    pub cpu: String,
    pub gpu: String,
}

/// Everything the parser knows about a log
#[derive(Debug, Clone, Default)]
pub struct LogSummary {
    pub line_count: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub fatal_error: Option<CallstackMessage>,
    pub ensures: Vec<CallstackMessage>,
    pub build_info: BuildInfo,
    pub platform_info: PlatformInfo,
    pub requested_exit: bool,
    pub test_exit_code: Option<i32>,
}

impl LogSummary {
    pub fn has_fatal_error(&self) -> bool {
        self.fatal_error.is_some()
    }
}

/// A log line attributed to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLine<'a> {
    pub channel: &'a str,
    /// Everything after `Log<Channel>:`
    pub text: &'a str,
    /// The whole line
    pub line: &'a str,
}

/// Parse an application log
pub struct LogParser {
    content: String,
    summary: OnceCell<LogSummary>,
}

impl std::fmt::Debug for LogParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogParser")
            .field("bytes", &self.content.len())
            .finish()
    }
}

impl LogParser {
    pub fn new(content: &str) -> Self {
        Self {
            content: normalize_newlines(content),
            summary: OnceCell::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Ok(Self::new(&String::from_utf8_lossy(&bytes)))
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.content.lines()
    }

    /// The full analysis, computed once
    pub fn summary(&self) -> &LogSummary {
        self.summary.get_or_init(|| self.compute_summary())
    }

    fn compute_summary(&self) -> LogSummary {
        let traces = extract_callstacks(&self.content);
        let fatal_error = traces.iter().find(|t| !t.is_ensure).cloned();
        let ensures = traces.into_iter().filter(|t| t.is_ensure).collect();

        LogSummary {
            line_count: self.lines().count(),
            warnings: self.warnings(None),
            errors: self.errors(None),
            fatal_error,
            ensures,
            build_info: self.build_info(),
            platform_info: self.platform_info(),
            requested_exit: self.has_request_exit(),
            test_exit_code: self.test_exit_code(),
        }
    }

    /// Lines logged to a channel, optionally only the given ones
    /// (case-insensitive, without the `Log` prefix)
    pub fn channel_lines(&self, channels: &[&str]) -> Vec<ChannelLine<'_>> {
        self.lines()
            .filter_map(|line| {
                let caps = CHANNEL_LINE.captures(line)?;
                let channel = caps.get(1)?.as_str();
                let text = caps.get(2).map_or("", |m| m.as_str());
                let wanted = channels.is_empty()
                    || channels.iter().any(|c| c.eq_ignore_ascii_case(channel));
                wanted.then_some(ChannelLine {
                    channel,
                    text,
                    line,
                })
            })
            .collect()
    }

    fn channel_lines_containing(&self, channel: Option<&str>, needle: &str) -> Vec<String> {
        let channels: Vec<&str> = channel.into_iter().collect();
        self.channel_lines(&channels)
            .into_iter()
            .filter(|l| l.text.contains(needle))
            .map(|l| l.line.to_string())
            .collect()
    }

    /// Channel lines containing `Warning:`
    pub fn warnings(&self, channel: Option<&str>) -> Vec<String> {
        self.channel_lines_containing(channel, "Warning:")
    }

    /// Channel lines containing `Error:`
    pub fn errors(&self, channel: Option<&str>) -> Vec<String> {
        self.channel_lines_containing(channel, "Error:")
    }

    pub fn fatal_error(&self) -> Option<&CallstackMessage> {
        self.summary().fatal_error.as_ref()
    }

    pub fn ensures(&self) -> &[CallstackMessage] {
        &self.summary().ensures
    }

    /// Exit code the test itself reported
    ///
    /// An explicit test-complete line wins, then a `RequestExitWithStatus`
    /// call, then a known success marker.
    pub fn test_exit_code(&self) -> Option<i32> {
        let last = |re: &Regex| {
            re.captures_iter(&self.content)
                .last()
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<i32>().ok())
        };

        if let Some(code) = last(&TEST_COMPLETE) {
            return Some(code);
        }
        if let Some(code) = last(&REQUEST_EXIT_WITH_STATUS) {
            return Some(code);
        }
        if self.content.contains(HEURISTIC_SUCCESS_MARKER) {
            tracing::warn!(
                "Found '{}' but no exit code, assuming success",
                HEURISTIC_SUCCESS_MARKER
            );
            return Some(0);
        }
        None
    }

    /// The application asked to exit normally and did not shut down on an error
    pub fn has_request_exit(&self) -> bool {
        EXIT_MARKER.is_match(&self.content) && !ERROR_SHUTDOWN_MARKER.is_match(&self.content)
    }

    pub fn build_info(&self) -> BuildInfo {
        let first = |re: &Regex| {
            re.captures(&self.content)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        };
        BuildInfo {
            build_name: first(&BUILD_NAME),
            branch: first(&BRANCH),
            changelist: first(&CHANGELIST).parse().unwrap_or(0),
            configuration: first(&BUILD_CONFIGURATION),
        }
    }

    pub fn platform_info(&self) -> PlatformInfo {
        self.lines()
            .find_map(|line| PLATFORM.captures(line))
            .map(|caps| PlatformInfo {
                os: caps[1].trim().to_string(),
                cpu: caps[2].trim().to_string(),
                gpu: caps[3].trim().to_string(),
            })
            .unwrap_or_default()
    }
}
