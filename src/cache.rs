// Credential cache

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::auth::{Credential, SessionState};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// In-memory snapshot of the current session
///
/// Many readers, one writer. Readers never wait on I/O. Every change of
/// `is_authenticated` is broadcast to subscribers in commit order; a
/// subscriber that falls more than the channel capacity behind sees
/// `RecvError::Lagged`.
#[derive(Clone)]
pub struct CredentialCache {
    /// Current session
    state: Arc<RwLock<SessionState>>,

    /// Authenticated-state transitions
    auth_tx: broadcast::Sender<bool>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (auth_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            auth_tx,
        }
    }

    /// Non-blocking snapshot of the session
    pub fn read(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the session; returns true when `is_authenticated` changed
    ///
    /// Called only by the manager with the outcome of a persistence job.
    pub fn write(&self, credential: Option<Credential>) -> bool {
        let next = SessionState::new(credential);
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let changed = state.is_authenticated() != next.is_authenticated();
        let authenticated = next.is_authenticated();
        *state = next;

        // Publish while still holding the lock so transitions go out in the
        // order they were committed.
        if changed {
            tracing::debug!(authenticated, "Session state changed");
            if self.auth_tx.send(authenticated).is_err() {
                tracing::trace!("No auth state subscribers");
            }
        }

        changed
    }

    /// Receive every future `is_authenticated` transition
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.auth_tx.subscribe()
    }
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new()
    }
}
