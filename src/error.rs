//! Harness error types

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the harness and its external collaborators
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A shell-level operation exited non-zero
    #[error("Command failed: `{command}` exited with {status}")]
    CommandFailed { command: String, status: i32 },

    /// The expected prompt was not observed in time
    #[error("Timed out after {}s waiting for `{pattern}`", .timeout.as_secs())]
    Timeout { pattern: String, timeout: Duration },

    /// A process could not be started
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The interactive session ended while output was still expected
    #[error("Session closed while waiting for `{pattern}`")]
    Eof { pattern: String },

    /// The resource is already gone
    #[error("Not found: {0}")]
    NotFound(String),

    /// Container runtime API failure
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// The port allow-list could not be loaded
    #[error("Allow-list error: {0}")]
    AllowList(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Whether this error means the target was already absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, HarnessError::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }
}

impl From<bollard::errors::Error> for HarnessError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            // 404: no such object, 304: container already stopped
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                message,
            } => HarnessError::NotFound(message),
            other => HarnessError::Runtime(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
