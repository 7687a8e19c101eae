//! Error types for hive-harness.

use crate::relay::RelayedError;
use crate::scope::ScopeId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for hive-harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Boxed error accepted from resources and worker threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while orchestrating test subjects.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Name was already registered in a `NameRegistry`.
    #[error("name already in use: {0}")]
    NameAlreadyInUse(String),

    /// A port range ran out of free ports.
    #[error("lack of ports: requested {requested} from range [{begin}, {end}) with next free port {next_free}")]
    LackOfPorts {
        /// First port of the exhausted range.
        begin: u16,
        /// One past the last port of the exhausted range.
        end: u16,
        /// Cursor position at the time of the request.
        next_free: u16,
        /// Number of ports that were requested.
        requested: u32,
    },

    /// Port range bounds are not usable.
    #[error("invalid port range [{begin}, {end})")]
    InvalidPortRange {
        /// First port.
        begin: u16,
        /// One past the last port.
        end: u16,
    },

    /// A waited-for condition was not satisfied in time.
    #[error("timeout after {timeout:?} waiting for {description}")]
    Timeout {
        /// What was being waited for.
        description: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// Invalid scope state for operation.
    #[error("invalid state for scope {scope}: expected {expected}, got {actual}")]
    InvalidState {
        /// Scope the operation targeted.
        scope: ScopeId,
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The root scope cannot be exited through `exit_scope`.
    #[error("no scope to exit: only the root scope is active")]
    NoScopeToExit,

    /// One or more registrants failed while a scope was torn down.
    #[error("teardown of scope {scope} failed: {}", summarize(.failures))]
    Teardown {
        /// Name of the scope being exited.
        scope: String,
        /// Every failure, in teardown order.
        failures: Vec<TeardownFailure>,
    },

    /// A worker thread relayed a fatal error to this thread.
    #[error(transparent)]
    Relayed(#[from] RelayedError),

    /// The process received an interrupt with no relayed error pending.
    #[error("interrupted")]
    Interrupted,

    /// Configuration value could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single registrant that failed during scope teardown.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Name the resource reported for itself.
    pub resource: String,
    /// The error it returned.
    pub error: BoxError,
}

fn summarize(failures: &[TeardownFailure]) -> String {
    match failures.first() {
        Some(first) => format!(
            "{} resource(s) failed, first {}: {}",
            failures.len(),
            first.resource,
            first.error
        ),
        None => "no failures recorded".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_message_names_first_failure() {
        let err = HarnessError::Teardown {
            scope: "package".into(),
            failures: vec![
                TeardownFailure {
                    resource: "node0".into(),
                    error: "still running".into(),
                },
                TeardownFailure {
                    resource: "wallet0".into(),
                    error: "busy".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("teardown of scope package failed"));
        assert!(msg.ends_with("2 resource(s) failed, first node0: still running"));
    }

    #[test]
    fn test_lack_of_ports_message_has_bounds() {
        let err = HarnessError::LackOfPorts {
            begin: 3000,
            end: 3002,
            next_free: 3002,
            requested: 1,
        };
        assert!(err.to_string().contains("[3000, 3002)"));
    }
}
