//! Error types for the cloud client.

use thiserror::Error;

/// Cloud client errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Transport failure before a status code was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code.
    #[error("Cloud answered {status}: {body}")]
    Status { status: u16, body: String },

    /// The endpoint is not offered by this cloud deployment.
    #[error("Endpoint not supported: {0}")]
    NotSupported(String),

    /// Response body did not match the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Client could not be constructed.
    #[error("Client setup failed: {0}")]
    Setup(String),
}

impl CloudError {
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// Convert to the bridge error taxonomy
impl From<CloudError> for kraftsync_core::Error {
    fn from(e: CloudError) -> Self {
        use kraftsync_core::Error;
        match e {
            CloudError::Http(err) if err.is_timeout() => {
                Error::NetworkTransient(format!("request timed out: {}", err))
            }
            CloudError::Http(err) if err.is_decode() => Error::Serialization(err.to_string()),
            CloudError::Http(err) => Error::NetworkTransient(err.to_string()),
            CloudError::Status { status, body } => match status {
                401 | 403 => Error::Auth(format!("{}: {}", status, body)),
                408 | 429 | 500..=599 => Error::NetworkTransient(format!("{}: {}", status, body)),
                _ => Error::Rejected {
                    status,
                    message: body,
                },
            },
            CloudError::NotSupported(s) => Error::Unsupported(s),
            CloudError::InvalidResponse(s) => Error::Serialization(s),
            CloudError::Setup(s) => Error::Config(s),
        }
    }
}
