//! Verification helpers for kernel request journals and event logs

use thiserror::Error;

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected entry '{entry}' not found after position {after} in {log:?}")]
    EntryNotFound {
        entry: String,
        after: usize,
        log: Vec<String>,
    },

    #[error("Expected '{entry}' {expected} time(s), found {actual} in {log:?}")]
    CountMismatch {
        entry: String,
        expected: usize,
        actual: usize,
        log: Vec<String>,
    },

    #[error("Unexpected entry '{entry}' in {log:?}")]
    UnexpectedEntry { entry: String, log: Vec<String> },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Checks that `expected` appears in `log` in order, other entries allowed
/// in between.
pub fn assert_in_order<S: AsRef<str>>(log: &[String], expected: &[S]) -> VerifyResult<()> {
    let mut pos = 0;
    for entry in expected {
        let entry = entry.as_ref();
        match log[pos..].iter().position(|e| e == entry) {
            Some(offset) => pos += offset + 1,
            None => {
                return Err(VerificationError::EntryNotFound {
                    entry: entry.to_string(),
                    after: pos,
                    log: log.to_vec(),
                })
            }
        }
    }
    Ok(())
}

/// Checks that `entry` occurs exactly `expected` times.
pub fn assert_count(log: &[String], entry: &str, expected: usize) -> VerifyResult<()> {
    let actual = log.iter().filter(|e| *e == entry).count();
    if actual != expected {
        return Err(VerificationError::CountMismatch {
            entry: entry.to_string(),
            expected,
            actual,
            log: log.to_vec(),
        });
    }
    Ok(())
}

/// Checks that no entry starts with `prefix`.
pub fn assert_absent(log: &[String], prefix: &str) -> VerifyResult<()> {
    match log.iter().find(|e| e.starts_with(prefix)) {
        Some(entry) => Err(VerificationError::UnexpectedEntry {
            entry: entry.clone(),
            log: log.to_vec(),
        }),
        None => Ok(()),
    }
}
