// Secure storage module
// Key/value persistence for credentials and the serialized worker that owns it

mod keychain;
mod legacy;
mod memory;

pub use keychain::{KeyringStore, DEFAULT_SERVICE_NAME};
pub use legacy::{LegacyStore, SqliteLegacyStore, LEGACY_ACCESS_TOKEN_KEY, LEGACY_USER_ID_KEY};
pub use memory::MemoryStore;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{StorageError, StorageResult};

/// Secure store key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Secure store key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Secure store key for the stringified user id
pub const USER_ID_KEY: &str = "user_id";

/// Secure store key for the RFC 3339 expiry timestamp
pub const EXPIRES_AT_KEY: &str = "expires_at";

/// Every key that makes up a persisted session, in write order
pub const SESSION_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    USER_ID_KEY,
    EXPIRES_AT_KEY,
];

/// Platform secure key/value storage
///
/// Implementations give strong per-key consistency and nothing more: no
/// retries, no caching. Reading a missing key is `Ok(None)`; deleting a
/// missing key succeeds.
pub trait SecureStore: Send + Sync {
    fn put(&self, key: &str, value: &str) -> StorageResult<()>;

    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn delete(&self, key: &str) -> StorageResult<()>;

    fn contains(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }
}

type Job = Box<dyn FnOnce(&dyn SecureStore) + Send>;

/// Serialized execution context for secure store access
///
/// A single worker thread runs submitted jobs one at a time, in submission
/// order. A job keeps running even if the task that submitted it is dropped.
pub struct StoreExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl StoreExecutor {
    /// Spawn the worker thread that owns `store`
    pub fn new(store: Arc<dyn SecureStore>) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name("secure-store".to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job(store.as_ref());
                }
                tracing::debug!("Secure store worker stopped");
            })?;

        Ok(Self { sender })
    }

    /// Run `op` on the worker and wait for its output
    pub async fn run<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&dyn SecureStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let job: Job = Box::new(move |store| {
            // A panicking job drops `tx`; the caller sees WorkerStopped and the
            // worker keeps serving later jobs.
            match catch_unwind(AssertUnwindSafe(|| op(store))) {
                Ok(output) => {
                    let _ = tx.send(output);
                }
                Err(_) => tracing::error!("Secure store job panicked"),
            }
        });

        self.sender
            .send(job)
            .map_err(|_| StorageError::WorkerStopped)?;

        rx.await.map_err(|_| StorageError::WorkerStopped)
    }
}
