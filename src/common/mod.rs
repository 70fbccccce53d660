//! Common utilities shared across the crate

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, ErrorKind, Result};

/// Normalize line endings to `\n`
pub fn normalize_newlines(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.to_string()
    }
}

/// Quote a path or argument for a device shell if it contains spaces
pub fn quote_if_needed(arg: &str) -> String {
    if arg.contains(' ') && !arg.starts_with('"') {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

/// Split a command line into arguments. Double quotes group words and are
/// removed; `\"` is a literal quote.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
                has_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines("a\r\nb\rc\n"), "a\nb\nc\n");
        assert_eq!(normalize_newlines("plain"), "plain");
    }

    #[test]
    fn test_quote_if_needed() {
        assert_eq!(quote_if_needed("/tmp/a b.apk"), "\"/tmp/a b.apk\"");
        assert_eq!(quote_if_needed("/tmp/ab.apk"), "/tmp/ab.apk");
    }

    #[test]
    fn test_split_command_line() {
        assert_eq!(
            split_command_line(r#"Orion -nullrhi  -ExecCmds="Automation RunTests Smoke" -a=\"b\" """#),
            vec!["Orion", "-nullrhi", "-ExecCmds=Automation RunTests Smoke", "-a=\"b\"", ""]
        );
        assert!(split_command_line("   ").is_empty());
    }
}
