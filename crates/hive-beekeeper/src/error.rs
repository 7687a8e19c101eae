//! Error types for hive-beekeeper.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for hive-beekeeper operations.
pub type Result<T> = std::result::Result<T, BeekeeperError>;

/// Errors that can occur while talking to a Beekeeper service.
#[derive(Debug, Error)]
pub enum BeekeeperError {
    /// Error from the harness (timeouts, port exhaustion, scope misuse)
    #[error(transparent)]
    Harness(#[from] hive_harness::HarnessError),

    /// The service could not be reached
    #[error("connection to {endpoint} failed: {reason}")]
    Connection {
        /// Endpoint the request was sent to
        endpoint: String,
        /// What went wrong
        reason: String,
    },

    /// The service did not answer in time
    #[error("{method} did not respond within {timeout:?}")]
    Timeout {
        /// JSON-RPC method name
        method: String,
        /// Time waited
        timeout: Duration,
    },

    /// The service answered with a JSON-RPC error
    #[error("{method} failed with code {code}: {message}")]
    ErrorInResponse {
        /// JSON-RPC method name
        method: String,
        /// Server error code
        code: i64,
        /// Server error message
        message: String,
        /// Serialized request
        request: String,
        /// Raw response body
        response: String,
    },

    /// Wrong password for a wallet
    #[error("invalid password for wallet '{wallet}': {message}")]
    InvalidPassword {
        /// Wallet the unlock was attempted on
        wallet: String,
        /// Server error code
        code: i64,
        /// Server error message
        message: String,
        /// Serialized request, password included
        request: String,
        /// Raw response body
        response: String,
    },

    /// The owning handle was closed
    #[error("{0} is no longer valid: its beekeeper handle was closed")]
    Invalidated(String),

    /// The service process failed to start
    #[error("beekeeper failed to start: {reason}")]
    StartupFailed {
        /// Notification or exit status that reported the failure
        reason: String,
        /// Last lines of the process stderr
        stderr_tail: String,
    },

    /// Malformed request or response
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeekeeperError {
    /// Whether the service reported a wrong password.
    pub fn is_invalid_password(&self) -> bool {
        matches!(self, Self::InvalidPassword { .. })
    }
}
