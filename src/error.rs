//! Error types for rseme.

use thiserror::Error;

/// Main error type for rseme operations.
///
/// Payloads are plain strings so the error can be cloned into shared
/// negotiation futures and `LicenseRequestComplete` events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No key system could be negotiated with the decryption module.
    #[error("Capability error: {0}")]
    Capability(String),

    /// Operation on a missing, closed or not-yet-selected session.
    #[error("Session state error: {0}")]
    SessionState(String),

    /// The content protection header or key set message is malformed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Transport failure, non-2xx status or malformed license response.
    #[error(
        "Network error{}: {message}",
        .status.map(|s| format!(" (status {})", s)).unwrap_or_default()
    )]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// A key ID could not be resolved to key material.
    #[error("No key material for key id {0}")]
    KeyResolution(String),

    /// The key set type is not `persistent` or `temporary`.
    #[error("Invalid key set type: {0}")]
    InvalidKeySetType(String),

    /// The configuration file is unreadable or invalid.
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a network error without an HTTP status.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            message: message.into(),
        }
    }

    /// Create a network error for a non-successful HTTP status.
    pub fn http_status(status: u16, url: &str) -> Self {
        Self::Network {
            status: Some(status),
            message: format!("HTTP {} for URL: {}", status, url),
        }
    }

    /// HTTP status carried by a network error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Network { status, .. } => *status,
            _ => None,
        }
    }
}

/// Result type alias for rseme operations.
pub type Result<T> = std::result::Result<T, Error>;
