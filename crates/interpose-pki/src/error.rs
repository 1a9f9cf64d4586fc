//! Error types for certificate sourcing, minting and engine provisioning.

use thiserror::Error;

/// Result type for interception PKI operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Interception PKI error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A required configuration input is missing, empty or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A credential source could not be located, parsed or decrypted.
    #[error("import failed: {0}")]
    Import(String),

    /// The requested key, curve or digest algorithm is not available.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Minting a leaf certificate for a single hostname failed.
    #[error("certificate minting failed for '{hostname}': {reason}")]
    CertificateMinting {
        /// Hostname the certificate was requested for.
        hostname: String,
        /// Underlying failure.
        reason: String,
    },

    /// The hostname is not a syntactically valid DNS name or IP address.
    #[error("invalid hostname: '{0}'")]
    InvalidHostname(String),

    /// Neither the request nor the session identify an upstream host.
    #[error("unable to determine upstream target: {0}")]
    UnresolvedTarget(String),

    /// Writing a key store or PEM export failed.
    #[error("export failed: {0}")]
    Export(String),

    /// Certificate parsing failed.
    #[error("certificate parsing failed: {0}")]
    Parse(String),

    /// The TLS library rejected an engine configuration.
    #[error("TLS engine configuration failed: {0}")]
    Engine(String),
}

impl Error {
    /// Returns `true` for errors that must abort provisioner construction.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration(_) | Self::Import(_) | Self::UnsupportedAlgorithm(_)
        )
    }

    pub(crate) fn minting(hostname: &str, reason: impl std::fmt::Display) -> Self {
        Self::CertificateMinting {
            hostname: hostname.to_string(),
            reason: reason.to_string(),
        }
    }
}
