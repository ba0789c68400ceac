//! Error types for the team daemon.
//!
//! Variants follow the failure classes the daemon distinguishes:
//! configuration, kernel resource acquisition, topology notification
//! vetoes, and scheduling failures of the run loop.

use crate::lifecycle::Stage;
use std::io;
use thiserror::Error;

/// Result type alias for daemon operations.
pub type TeamdResult<T> = Result<T, TeamdError>;

/// Errors that can occur in the team daemon.
#[derive(Debug, Error)]
pub enum TeamdError {
    /// Configuration value present but malformed.
    #[error("Invalid configuration at {path}: {message}")]
    Config {
        /// JSON pointer of the offending value.
        path: String,
        /// Error message.
        message: String,
    },

    /// Required configuration key is absent.
    #[error("Missing required configuration key {0}")]
    MissingConfig(String),

    /// No compiled-in runner with this name.
    #[error("No runner named \"{0}\" available")]
    RunnerNotFound(String),

    /// Kernel communication request failed.
    #[error("Kernel operation failed: {operation}: {message}")]
    Kernel {
        /// The operation that failed (e.g., "create", "port_add").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Port is not known to the registry or to the kernel.
    #[error("Port '{0}' not found")]
    PortNotFound(String),

    /// Port is already a member.
    #[error("Port '{0}' already exists")]
    PortExists(String),

    /// Run loop callback with this (owner, name) pair already exists.
    #[error("Callback {owner}/{name} already registered")]
    AlreadyRegistered {
        /// Owner label.
        owner: String,
        /// Callback name.
        name: String,
    },

    /// Run loop callback with this (owner, name) pair does not exist.
    #[error("Callback {owner}/{name} not registered")]
    NotRegistered {
        /// Owner label.
        owner: String,
        /// Callback name.
        name: String,
    },

    /// State contribution name taken.
    #[error("State contribution \"{0}\" already registered")]
    StateExists(String),

    /// Per-port private data already attached by this creator.
    #[error("Private data of {owner} already attached to port {ifindex}")]
    PrivExists {
        /// Interface index of the port.
        ifindex: u32,
        /// Creator label.
        owner: String,
    },

    /// A port_added subscriber refused the port.
    #[error("Port add vetoed by {subscriber}: {source}")]
    Vetoed {
        /// Name of the refusing subscriber.
        subscriber: String,
        /// The subscriber's error.
        #[source]
        source: Box<TeamdError>,
    },

    /// A lifecycle stage failed; completed stages have been unwound.
    #[error("Initialization failed at stage {stage}: {source}")]
    Stage {
        /// The stage that failed.
        stage: Stage,
        /// The stage's error.
        #[source]
        source: Box<TeamdError>,
    },

    /// Multiplexing wait failed with something other than EINTR.
    #[error("Poll failed: {0}")]
    Poll(#[source] nix::errno::Errno),

    /// Processing kernel notifications failed.
    #[error("Team device event processing failed: {0}")]
    DeviceDesync(String),

    /// Daemon state does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Failed to spawn a shell command.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// PID file handling failed.
    #[error("PID file {path}: {message}")]
    PidFile {
        /// PID file path.
        path: String,
        /// Error message.
        message: String,
    },

    /// System call failed.
    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Hardware address did not parse.
    #[error(transparent)]
    Parse(#[from] teamd_types::ParseError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TeamdError {
    /// Creates a configuration error.
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a kernel error.
    pub fn kernel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a PID file error.
    pub fn pid_file(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::PidFile {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Returns true if a run loop callback returning this error must
    /// terminate the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TeamdError::Poll(_) | TeamdError::DeviceDesync(_))
    }

    /// Returns the stage a lifecycle error was raised at.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            TeamdError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Strips lifecycle and veto wrappers.
    pub fn root_cause(&self) -> &TeamdError {
        match self {
            TeamdError::Stage { source, .. } | TeamdError::Vetoed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
