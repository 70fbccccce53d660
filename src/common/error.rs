//! Error types for devicelab
//!
//! Every error belongs to one of a handful of kinds. Callers branch on the
//! kind rather than on individual variants: configuration problems abort a
//! session before launch, transport problems may earn a retry, parse problems
//! degrade a single record, and resource problems take one device out of play.

use std::io;
use thiserror::Error;

use crate::build::Platform;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used for retry and quarantine decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unsupported role/platform, no matching build, bad settings
    Configuration,
    /// Device unreachable, command timed out or failed
    Transport,
    /// Malformed manifest or log fragment
    Parse,
    /// Device unauthorized, missing, out of space
    Resource,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::Parse => write!(f, "parse"),
            Self::Resource => write!(f, "resource"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for devicelab
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("No device backend registered for platform {0}")]
    UnsupportedPlatform(Platform),

    #[error("No build matching {0} was found. Check the build path and the requested configuration")]
    NoMatchingBuild(String),

    #[error("Build is not valid for this device: {0}")]
    InvalidBuild(String),

    // === Transport Errors ===
    #[error("Device '{device}' is unreachable: {reason}")]
    DeviceUnreachable { device: String, reason: String },

    #[error("Command '{command}' timed out after {secs} seconds")]
    CommandTimeout { command: String, secs: u64 },

    #[error("Command '{command}' failed with exit code {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error("Failed to transfer {source_path} to {destination} on '{device}': {reason}")]
    Transfer {
        device: String,
        source_path: String,
        destination: String,
        reason: String,
    },

    #[error("Failed to launch on '{device}': {reason}")]
    LaunchFailed { device: String, reason: String },

    // === Parse Errors ===
    #[error("Malformed install descriptor '{path}': {reason}")]
    Manifest { path: String, reason: String },

    // === Resource Errors ===
    #[error("Device '{0}' is connected but this host is not authorized. Accept the debugging prompt on the device")]
    DeviceUnauthorized(String),

    #[error("Device '{0}' was not found. Check that it is attached and visible to the bridge tool")]
    DeviceNotFound(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Unable to acquire devices: {0}")]
    DevicesUnavailable(String),

    // === State Errors ===
    #[error("Cannot {action} while device is {state}")]
    InvalidState { action: String, state: String },

    #[error("Operation cancelled")]
    Cancelled,

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Test Errors ===
    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::UnsupportedPlatform(_)
            | Error::NoMatchingBuild(_)
            | Error::InvalidBuild(_) => ErrorKind::Configuration,

            Error::DeviceUnreachable { .. }
            | Error::CommandTimeout { .. }
            | Error::CommandFailed { .. }
            | Error::Transfer { .. }
            | Error::LaunchFailed { .. } => ErrorKind::Transport,

            Error::Manifest { .. } => ErrorKind::Parse,

            Error::DeviceUnauthorized(_)
            | Error::DeviceNotFound(_)
            | Error::Credentials(_)
            | Error::DevicesUnavailable(_) => ErrorKind::Resource,

            Error::Io(e) if is_disk_full(e) => ErrorKind::Resource,

            _ => ErrorKind::Internal,
        }
    }

    /// Whether a test that hit this error may reasonably be run again
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Resource)
    }

    /// Create a command failed error
    pub fn command_failed(command: &str, code: i32, output: &str) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            code,
            output: output.trim().to_string(),
        }
    }

    /// Create a transfer error
    pub fn transfer(device: &str, source: &str, destination: &str, reason: &str) -> Self {
        Self::Transfer {
            device: device.to_string(),
            source_path: source.to_string(),
            destination: destination.to_string(),
            reason: reason.trim().to_string(),
        }
    }

    /// Create an unreachable device error
    pub fn unreachable(device: &str, reason: &str) -> Self {
        Self::DeviceUnreachable {
            device: device.to_string(),
            reason: reason.trim().to_string(),
        }
    }

    /// Create a launch failure error
    pub fn launch_failed(device: &str, reason: &str) -> Self {
        Self::LaunchFailed {
            device: device.to_string(),
            reason: reason.trim().to_string(),
        }
    }

    /// Create a malformed manifest error
    pub fn manifest(path: &std::path::Path, reason: &str) -> Self {
        Self::Manifest {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: &str) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }
}

/// ERROR_DISK_FULL
#[cfg(windows)]
const DISK_FULL: i32 = 112;
/// ENOSPC
#[cfg(not(windows))]
const DISK_FULL: i32 = 28;

fn is_disk_full(e: &io::Error) -> bool {
    e.raw_os_error() == Some(DISK_FULL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            Error::NoMatchingBuild("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::CommandTimeout {
                command: "adb".into(),
                secs: 1
            }
            .kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            Error::manifest(std::path::Path::new("Install.bat"), "no uninstall").kind(),
            ErrorKind::Parse
        );
        assert_eq!(
            Error::DeviceUnauthorized("emulator-5554".into()).kind(),
            ErrorKind::Resource
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::unreachable("dev", "gone").is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_disk_full_is_resource() {
        let e = Error::Io(io::Error::from_raw_os_error(DISK_FULL));
        assert_eq!(e.kind(), ErrorKind::Resource);
    }
}
