//! Error taxonomy shared by every kraftsync crate.

use thiserror::Error;

/// Result type used across the bridge.
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Timeouts, connection resets and 5xx answers. Retried with backoff.
    #[error("Transient network error: {0}")]
    NetworkTransient(String),

    /// The remote side rejected our credential.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Refresh-and-retry already failed; the connection needs a new grant.
    #[error("Site {0} needs re-authentication")]
    NeedsReauth(String),

    /// Data that contradicts earlier observations, e.g. a counter decrease.
    #[error("Data conflict on {local_id}: {detail}")]
    DataConflict { local_id: String, detail: String },

    /// No mapping exists for a cloud device id.
    #[error("No mapping for cloud device {0}")]
    UnmappedTarget(String),

    /// A command could not be turned into a local action.
    #[error("Command {command_id} cannot be resolved: {reason}")]
    UnresolvableCommand { command_id: String, reason: String },

    /// Some items of a batched push were rejected.
    #[error("Batch partially rejected: {failed} of {total} items")]
    PartialBatch { failed: usize, total: usize },

    /// The remote side does not support the requested operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The host platform failed or refused an operation.
    #[error("Host platform error: {0}")]
    Host(String),

    /// A local entity exists but currently reports no usable state.
    #[error("Entity unavailable: {0}")]
    EntityUnavailable(String),

    /// The remote side rejected the request for a non-retryable reason.
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation exceeded its deadline.
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// IO error, kept as text so the error stays `Clone`.
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkTransient(_) | Error::Timeout(_))
    }

    /// Whether the error is an authorization rejection.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::NeedsReauth(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::NetworkTransient("503".into()).is_transient());
        assert!(Error::Timeout(5000).is_transient());
        assert!(!Error::Auth("401".into()).is_transient());
        assert!(!Error::UnmappedTarget("abc".into()).is_transient());
        assert!(
            !Error::Rejected {
                status: 400,
                message: "bad".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_auth_classification() {
        assert!(Error::Auth("401".into()).is_auth());
        assert!(Error::NeedsReauth("site".into()).is_auth());
        assert!(!Error::Host("down".into()).is_auth());
    }
}
