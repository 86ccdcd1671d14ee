//! Error types for tickscope-core

use thiserror::Error;

/// Main error type for the tickscope-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was stopped through its cancellation token.
    ///
    /// Never a source failure; callers stop quietly.
    #[error("operation aborted")]
    Cancelled,

    /// Capture source could not be read
    #[error("source unavailable ({locator}): {message}")]
    SourceUnavailable { locator: String, message: String },

    /// Capture not found
    #[error("capture not found: {0}")]
    CaptureNotFound(String),

    /// Plugin not found
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin failed validation (message is the stored validation error)
    #[error("plugin {id} is invalid: {message}")]
    PluginInvalid { id: String, message: String },

    /// Control protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Derivation job error
    #[error("derivation error: {0}")]
    Derivation(String),
}

impl Error {
    /// True when the error is the cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for file errors that may clear up on their own: the writer has not
    /// created the file yet, permissions are being fixed, or the file is busy.
    pub fn is_recoverable_source(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type alias for tickscope-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let missing = Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(missing.is_recoverable_source());
        assert!(!missing.is_cancelled());

        let broken = Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidData));
        assert!(!broken.is_recoverable_source());

        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_recoverable_source());
    }
}
