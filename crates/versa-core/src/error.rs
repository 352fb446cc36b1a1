//! Error types for Versa Core

use thiserror::Error;

/// Result type alias for player operations
pub type Result<T> = std::result::Result<T, Error>;

/// Player error types
#[derive(Error, Debug)]
pub enum Error {
    // Key delivery errors
    #[error("Failed to fetch certificate from {url}: {reason}")]
    CertificateFetch { url: String, reason: String },

    #[error("License request to {url} failed")]
    LicenseRequest { url: String, source: reqwest::Error },

    #[error("Unsupported locator scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    // Playback errors
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("No tokio runtime available for key delivery")]
    NoRuntime,

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a certificate fetch error
    pub fn certificate(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CertificateFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CertificateFetch { .. }
                | Error::LicenseRequest { .. }
                | Error::Network(_)
                | Error::Io(_)
        )
    }

    /// Returns the error code for logs and CLI output
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::CertificateFetch { .. } => "CERTIFICATE_FETCH",
            Error::LicenseRequest { .. } => "LICENSE_REQUEST",
            Error::UnsupportedScheme { .. } => "UNSUPPORTED_SCHEME",
            Error::InvalidStatusTransition { .. } => "INVALID_STATUS",
            Error::NoRuntime => "NO_RUNTIME",
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::ConfigParse(_) => "CONFIG_PARSE",
            Error::Io(_) => "IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NoRuntime.error_code(), "NO_RUNTIME");
        assert_eq!(
            Error::certificate("file:///tmp/cert.der", "missing").error_code(),
            "CERTIFICATE_FETCH"
        );
        let io = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(io.error_code(), "IO");
        assert!(io.is_recoverable());
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::certificate("https://example.com/cert", "503").is_recoverable());
        assert!(!Error::InvalidConfig("skip interval".into()).is_recoverable());
    }
}
