//! Error types for distcache
//!
//! Store-level failures are absorbed and logged by the stores themselves;
//! this enum covers the errors that do reach a caller: bad keys, codec
//! failures and configuration problems.

use thiserror::Error;

/// Common result type for distcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for distcache
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid hash key length: expected {expected} bytes, got {actual}")]
    InvalidHashKey { expected: usize, actual: usize },

    #[error("invalid hash key encoding: {0}")]
    InvalidHashEncoding(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a fresh recomputation of the value would avoid this error.
    ///
    /// Codec and storage problems are local to one value; key and
    /// configuration errors are caller bugs.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Deserialization(_) | Self::Compression(_) | Self::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverable() {
        assert!(Error::storage("db gone").is_recoverable());
        assert!(Error::deserialization("truncated").is_recoverable());
        assert!(!Error::configuration("bad").is_recoverable());
        assert!(
            !Error::InvalidHashKey {
                expected: 32,
                actual: 3
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidHashKey {
            expected: 32,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "invalid hash key length: expected 32 bytes, got 5"
        );
    }
}
