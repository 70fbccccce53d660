//! Fatal errors, ensures and their callstacks

use once_cell::sync::Lazy;
use regex::Regex;

/// Consecutive non-frame lines that end a callstack
const MAX_FRAME_GAP: usize = 5;

static FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[Callstack\]\s+(0x[0-9A-Fa-f]+\s+\S+?!.+?\s+\[.*\])").expect("static regex")
});

/// Trace headers, checked in order; the first that matches a line wins
static TRACE_PATTERNS: Lazy<Vec<(TraceKind, Regex)>> = Lazy::new(|| {
    [
        (TraceKind::Fatal, r"Fatal error:\s*(.*)"),
        (TraceKind::Fatal, r"=== Fatal Error: ===\s*(.*)"),
        (TraceKind::Fatal, r"Assertion failed:\s*(.*)"),
        (TraceKind::Fatal, r"Unhandled Exception:\s*(.*)"),
        (TraceKind::Fatal, r"LowLevelFatalError\s*(.*)"),
        (TraceKind::Ensure, r"Ensure condition failed:\s*(.*)"),
        (TraceKind::Postmortem, r"Postmortem Cause:\s*(.*)"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("static regex")))
    .collect()
});

/// What kind of trace a header announced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Fatal,
    Ensure,
    /// Cause reported after the fact by a crash handler
    Postmortem,
}

/// A trace header and the callstack printed after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallstackMessage {
    /// Zero-based line of the header
    pub position: usize,
    pub message: String,
    /// Frames as `0xADDRESS module!function [file:line]`
    pub callstack: Vec<String>,
    pub is_ensure: bool,
    pub kind: TraceKind,
}

fn match_header(line: &str) -> Option<(TraceKind, String)> {
    TRACE_PATTERNS.iter().find_map(|(kind, re)| {
        re.captures(line).map(|caps| {
            let message = caps.get(1).map_or("", |m| m.as_str()).trim();
            (*kind, message.to_string())
        })
    })
}

fn frame(line: &str) -> Option<String> {
    FRAME
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Every fatal error and ensure in `content`, in order, with adjacent
/// duplicates collapsed and postmortem causes folded into the trace before them
pub fn extract_callstacks(content: &str) -> Vec<CallstackMessage> {
    let lines: Vec<&str> = content.lines().collect();
    let mut traces = Vec::new();

    for (position, line) in lines.iter().enumerate() {
        let Some((kind, mut message)) = match_header(line) else {
            continue;
        };

        if message.is_empty() {
            if let Some(next) = lines[position + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
            {
                if frame(next).is_none() && match_header(next).is_none() {
                    message = next.trim_start_matches("Error:").trim().to_string();
                }
            }
        }

        let mut callstack = Vec::new();
        let mut gap = 0;
        for next in &lines[position + 1..] {
            if let Some(frame) = frame(next) {
                callstack.push(frame);
                gap = 0;
            } else if match_header(next).is_some() {
                break;
            } else {
                gap += 1;
                if gap >= MAX_FRAME_GAP {
                    break;
                }
            }
        }

        traces.push(CallstackMessage {
            position,
            message,
            callstack,
            is_ensure: kind == TraceKind::Ensure,
            kind,
        });
    }

    merge_traces(traces)
}

/// Collapse adjacent traces with the same message (keeping the longer
/// callstack) and fold each postmortem into the trace kept before it.
/// A postmortem with nothing before it is kept on its own.
pub fn merge_traces(traces: Vec<CallstackMessage>) -> Vec<CallstackMessage> {
    let mut kept: Vec<CallstackMessage> = Vec::with_capacity(traces.len());
    let mut repeats = 1;

    for trace in traces {
        if trace.kind == TraceKind::Postmortem {
            repeats = 1;
            match kept.last_mut() {
                Some(previous) => previous.callstack = trace.callstack,
                None => kept.push(trace),
            }
            continue;
        }

        if let Some(previous) = kept.last_mut() {
            if previous.message == trace.message && previous.is_ensure == trace.is_ensure {
                repeats += 1;
                if repeats == 3 {
                    tracing::warn!(
                        "'{}' logged {} or more times in a row; keeping the longest callstack",
                        trace.message,
                        repeats
                    );
                }
                if trace.callstack.len() > previous.callstack.len() {
                    previous.callstack = trace.callstack;
                }
                continue;
            }
        }

        repeats = 1;
        kept.push(trace);
    }

    kept
}
