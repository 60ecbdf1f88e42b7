// Error handling module
// Defines storage and authentication error types

use std::time::Duration;
use thiserror::Error;

/// Secure storage errors
///
/// An absent key is never an error: reads return `Ok(None)` and deletes of
/// missing keys succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Backend refused access (device locked, keychain unavailable)
    #[error("Secure storage is locked: {0}")]
    Locked(String),

    /// Entry exists but cannot be decoded
    #[error("Corrupt entry for '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// Any other backend failure
    #[error("Storage backend error for '{key}': {message}")]
    Backend { key: String, message: String },

    /// The serialized store worker is gone
    #[error("Secure storage worker has stopped")]
    WorkerStopped,
}

/// Authentication errors
///
/// These never cross the manager boundary; they are logged and turned into
/// `None`/`false` results plus bus events.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Refresh requested but no refresh token is persisted
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Auth server refused the refresh grant (400/401 on refresh)
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Auth server answered with a non-success status
    #[error("Auth server rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Transport-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Response body was unusable
    #[error("Invalid auth response: {0}")]
    InvalidResponse(String),

    /// Auth server did not answer in time
    #[error("Auth request timed out after {0:?}")]
    Timeout(Duration),

    /// Persistence failure while committing credentials
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// More than one refresh operation in flight
    #[error("Concurrent refresh operation detected")]
    ConcurrentAccessViolation,
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Network(format!("request timed out: {}", err))
        } else if err.is_decode() {
            AuthError::InvalidResponse(err.to_string())
        } else {
            AuthError::Network(err.to_string())
        }
    }
}

/// Result type alias for secure storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for auth client operations
pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_messages() {
        let err = StorageError::Locked("keychain unavailable".to_string());
        assert_eq!(
            err.to_string(),
            "Secure storage is locked: keychain unavailable"
        );

        let err = StorageError::Corrupt {
            key: "user_id".to_string(),
            reason: "not an integer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Corrupt entry for 'user_id': not an integer"
        );

        let err = StorageError::Backend {
            key: "access_token".to_string(),
            message: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Storage backend error for 'access_token': disk full"
        );

        assert_eq!(
            StorageError::WorkerStopped.to_string(),
            "Secure storage worker has stopped"
        );
    }

    #[test]
    fn test_auth_error_messages() {
        assert_eq!(
            AuthError::NoRefreshToken.to_string(),
            "No refresh token available"
        );

        let err = AuthError::Rejected {
            status: 401,
            message: "invalid_grant".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Auth server rejected request: 401 - invalid_grant"
        );

        let err = AuthError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Auth request timed out after 30s");
    }

    #[test]
    fn test_storage_error_converts_into_auth_error() {
        let err: AuthError = StorageError::Locked("device locked".to_string()).into();
        assert!(matches!(err, AuthError::Storage(StorageError::Locked(_))));
        assert_eq!(
            err.to_string(),
            "Storage error: Secure storage is locked: device locked"
        );
    }

    #[test]
    fn test_concurrent_access_violation_message() {
        assert_eq!(
            AuthError::ConcurrentAccessViolation.to_string(),
            "Concurrent refresh operation detected"
        );
    }
}
