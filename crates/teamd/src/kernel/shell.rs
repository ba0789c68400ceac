//! Synchronous shell command execution for the Linux backend.
//!
//! Commands run through `/bin/sh -c`. Every interpolated argument must go
//! through [`shellquote`].

use crate::error::{TeamdError, TeamdResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::{Command, Stdio};

/// Path to the `ip` command.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `teamnl` team netlink utility.
pub const TEAMNL_CMD: &str = "/usr/bin/teamnl";

/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Wraps `s` in double quotes, escaping characters special inside them.
///
/// ```
/// use teamd::kernel::shell::shellquote;
///
/// assert_eq!(shellquote("team0"), "\"team0\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout and stderr for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs `cmd` and returns its result whatever the exit code.
pub fn exec(cmd: &str) -> TeamdResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| TeamdError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs `cmd`, turning a non-zero exit into an error.
pub fn exec_or_err(cmd: &str) -> TeamdResult<String> {
    let result = exec(cmd)?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(TeamdError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
