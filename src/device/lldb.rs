//! lldb crash dump conversion
//!
//! iOS applications run under lldb. When they crash, lldb prints thread
//! backtraces; we turn the crashing thread into engine-style callstack lines
//! so the log parser reports it like any other fatal error.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d+\.\d+\.\d+-\d+\.\d+\.\d+):\d+\]\[\s*(\d+)\]").expect("static regex")
});
static THREAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"thread\s#(\d+),?(.*)").expect("static regex"));
static SYMBOLICATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s#\d+:\s0x([\da-f]+)\s(.+)`(.+)\sat\s(.+)\s\[opt\]").expect("static regex")
});
static UNSYMBOLICATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"frame\s#\d+:\s0x([\da-f]+)\s(.+)`(.+)\s\+\s\d+").expect("static regex")
});
static CLEAN_EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"TEST COMPLETE\. EXIT CODE: 0\b").expect("static regex"));

/// One frame of a crashed thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashFrame {
    pub address: String,
    pub module: String,
    pub symbol: String,
    pub source: Option<String>,
    pub line: Option<String>,
}

impl fmt::Display for CrashFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = self.symbol.replace(' ', "^");
        match &self.source {
            Some(source) => {
                let line = self
                    .line
                    .as_ref()
                    .map(|l| format!(":{}", l))
                    .unwrap_or_default();
                write!(
                    f,
                    "Error: [Callstack] 0x{} {}!{} [{}{}]",
                    self.address, self.module, symbol, source, line
                )
            }
            None => write!(
                f,
                "Error: [Callstack] 0x{} {}!{} [???]",
                self.address, self.module, symbol
            ),
        }
    }
}

/// A thread from an lldb backtrace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashThread {
    pub number: u32,
    pub status: String,
    pub current: bool,
    pub frames: Vec<CrashFrame>,
}

fn parse_frame(line: &str) -> Option<CrashFrame> {
    if let Some(c) = SYMBOLICATED.captures(line) {
        let (source, line) = match c[4].split_once(':') {
            Some((source, rest)) => (
                source.to_string(),
                rest.split(':').next().map(str::to_string),
            ),
            None => (c[4].to_string(), None),
        };
        return Some(CrashFrame {
            address: c[1].to_string(),
            module: c[2].to_string(),
            symbol: c[3].to_string(),
            source: Some(source),
            line,
        });
    }

    UNSYMBOLICATED.captures(line).map(|c| CrashFrame {
        address: c[1].to_string(),
        module: c[2].to_string(),
        symbol: c[3].to_string(),
        source: None,
        line: None,
    })
}

/// Parsed crash: the crashing thread plus the last log timestamp and frame
#[derive(Debug, Clone)]
pub struct CrashDump {
    pub thread: CrashThread,
    pub timestamp: Option<String>,
    pub frame_number: u32,
}

/// Find the crashing thread in lldb output
///
/// The first thread reported is the one that stopped. If a later full
/// backtrace lists the same thread again, that fuller copy is used.
pub fn parse_crash_dump(output: &str) -> Option<CrashDump> {
    let mut threads: Vec<CrashThread> = Vec::new();
    let mut current: Option<usize> = None;
    let mut timestamp = None;
    let mut frame_number = 0;

    for raw in output.lines() {
        let line = raw.trim();

        if CLEAN_EXIT.is_match(line) {
            return None;
        }

        if let Some(c) = TIMESTAMP.captures(line) {
            timestamp = Some(c[1].to_string());
            frame_number = c[2].parse().unwrap_or(0);
            continue;
        }

        if let Some(idx) = current {
            match parse_frame(line) {
                Some(frame) => {
                    threads[idx].frames.push(frame);
                    continue;
                }
                None => current = None,
            }
        }

        if let Some(c) = THREAD.captures(line) {
            threads.push(CrashThread {
                number: c[1].parse().unwrap_or(0),
                status: c[2].trim().to_string(),
                current: line.starts_with('*'),
                frames: Vec::new(),
            });
            current = Some(threads.len() - 1);
        }
    }

    let crashed = threads.first()?;
    let thread = threads[1..]
        .iter()
        .find(|t| t.number == crashed.number)
        .unwrap_or_else(|| {
            tracing::warn!("Unable to parse full crash callstack");
            crashed
        })
        .clone();

    Some(CrashDump {
        thread,
        timestamp,
        frame_number,
    })
}

/// Render the crashing thread as an engine-style fatal error block, or
/// `None` if the output holds no crash (or the test completed cleanly)
pub fn generate_crash_log(output: &str) -> Option<String> {
    let dump = parse_crash_dump(output)?;

    let mut log = format!(
        "[{}:000][{}]LogCore: === Fatal Error: ===\n",
        dump.timestamp
            .as_deref()
            .unwrap_or("0000.00.00-00.00.00"),
        dump.frame_number
    );
    log.push_str(&format!(
        "Error: Thread #{} {}\n",
        dump.thread.number, dump.thread.status
    ));
    let frames: Vec<String> = dump.thread.frames.iter().map(|f| f.to_string()).collect();
    log.push_str(&frames.join("\n"));
    Some(log)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRASH: &str = "\
[2019.05.01-12.34.56:789][ 42]LogTemp: Display: Ticking
* thread #1, queue = 'com.apple.main-thread', stop reason = EXC_BAD_ACCESS (code=1, address=0x0)
    frame #0: 0x0000000100a1b2c3 OrionClient`AOrionCharacter::Tick(float) at OrionCharacter.cpp:120 [opt]
(lldb) thread backtrace all
* thread #1, queue = 'com.apple.main-thread', stop reason = EXC_BAD_ACCESS (code=1, address=0x0)
    frame #0: 0x0000000100a1b2c3 OrionClient`AOrionCharacter::Tick(float) at OrionCharacter.cpp:120 [opt]
    frame #1: 0x0000000100a1b400 OrionClient`AActor::TickActor + 88
    frame #2: 0x00000001a0b0c0d0 libdyld.dylib`start + 4
  thread #2
    frame #0: 0x00000001a1a2a3a4 libsystem_kernel.dylib`mach_msg_trap + 8
";

    #[test]
    fn test_full_backtrace_preferred() {
        let dump = parse_crash_dump(CRASH).unwrap();
        assert_eq!(dump.thread.number, 1);
        assert!(dump.thread.current);
        assert_eq!(dump.thread.frames.len(), 3);
        assert_eq!(dump.timestamp.as_deref(), Some("2019.05.01-12.34.56"));
        assert_eq!(dump.frame_number, 42);
    }

    #[test]
    fn test_frame_formatting() {
        let dump = parse_crash_dump(CRASH).unwrap();
        assert_eq!(
            dump.thread.frames[0].to_string(),
            "Error: [Callstack] 0x0000000100a1b2c3 OrionClient!AOrionCharacter::Tick(float) [OrionCharacter.cpp:120]"
        );
        assert_eq!(
            dump.thread.frames[1].to_string(),
            "Error: [Callstack] 0x0000000100a1b400 OrionClient!AActor::TickActor [???]"
        );
    }

    #[test]
    fn test_crash_log_header() {
        let log = generate_crash_log(CRASH).unwrap();
        let mut lines = log.lines();
        assert_eq!(
            lines.next(),
            Some("[2019.05.01-12.34.56:000][42]LogCore: === Fatal Error: ===")
        );
        assert!(lines.next().unwrap().starts_with("Error: Thread #1 queue"));
        assert_eq!(lines.count(), 3);
    }

    #[test]
    fn test_clean_exit_suppresses_crash_log() {
        let output = format!("**** TEST COMPLETE. EXIT CODE: 0 ****\n{}", CRASH);
        assert!(generate_crash_log(&output).is_none());
        assert!(generate_crash_log("LogInit: nothing to see").is_none());
    }
}
