//! Error types for directory lookups.
//!
//! Every failure a lookup can produce falls into one of four buckets. A search
//! that matches nothing is not an error; callers see it as `Ok(None)`.

use serde::Serialize;
use thiserror::Error;

/// Main error type for directory lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport failure: the server was unreachable, StartTLS failed or the
    /// connection timed out.
    #[error("Could not connect to LDAP server: {0}")]
    ConnectionError(String),

    /// The server rejected the configured bind credentials.
    #[error("LDAP bind failed: {0}")]
    BindError(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The search request itself failed. An empty result is not a failure.
    #[error("LDAP search failed: {0}")]
    SearchError(String),
}

/// Specialized result type for directory lookups.
pub type Result<T> = std::result::Result<T, Error>;

/// Error report handed to the host's error channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    /// Stable error code for programmatic handling
    pub code: &'static str,
    /// Subsystem that raised the error
    pub kind: &'static str,
    /// Human-readable error message
    pub message: String,
}

impl Error {
    /// Returns the stable error code for this error type.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => "LDAP_CONNECTION_ERROR",
            Self::BindError(_) => "LDAP_BIND_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::SearchError(_) => "LDAP_SEARCH_ERROR",
        }
    }

    /// Converts the error into an [`ErrorReport`].
    #[must_use]
    pub fn into_error_report(self) -> ErrorReport {
        ErrorReport {
            code: self.error_code(),
            kind: "ldap",
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid directory URI: {err}"))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ConfigError(err.to_string())
    }
}
