// OS keychain backed secure store

use keyring::Entry;

use super::SecureStore;
use crate::error::{StorageError, StorageResult};

/// Default keychain service name
pub const DEFAULT_SERVICE_NAME: &str = "session-keeper";

/// Secure store backed by the platform keychain
///
/// Each key is a separate keychain entry under `service`.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, key: &str) -> StorageResult<Entry> {
        Entry::new(&self.service, key).map_err(|e| map_keyring_error(key, e))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl SecureStore for KeyringStore {
    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| map_keyring_error(key, e))
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(key, e)),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(key, e)),
        }
    }
}

/// Translate keychain failures into the storage taxonomy
fn map_keyring_error(key: &str, err: keyring::Error) -> StorageError {
    match err {
        keyring::Error::NoStorageAccess(inner) => StorageError::Locked(inner.to_string()),
        keyring::Error::BadEncoding(_) => StorageError::Corrupt {
            key: key.to_string(),
            reason: "entry is not valid UTF-8".to_string(),
        },
        keyring::Error::Ambiguous(_) => StorageError::Corrupt {
            key: key.to_string(),
            reason: "multiple keychain entries match".to_string(),
        },
        other => StorageError::Backend {
            key: key.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_name() {
        let store = KeyringStore::default();
        assert_eq!(store.service(), "session-keeper");
    }

    #[test]
    fn test_map_bad_encoding_is_corrupt() {
        let err = map_keyring_error("user_id", keyring::Error::BadEncoding(vec![0xff]));
        assert_eq!(
            err,
            StorageError::Corrupt {
                key: "user_id".to_string(),
                reason: "entry is not valid UTF-8".to_string(),
            }
        );
    }

    #[test]
    fn test_map_other_errors_keep_key() {
        let err = map_keyring_error(
            "access_token",
            keyring::Error::TooLong("service".to_string(), 255),
        );
        assert!(matches!(err, StorageError::Backend { ref key, .. } if key == "access_token"));
    }
}
