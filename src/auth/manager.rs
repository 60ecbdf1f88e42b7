use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::client::AuthClient;
use super::events::EventBus;
use super::refresh::{Precheck, RefreshCoordinator, RefreshHandle, RefreshState, RefreshTicket};
use super::types::{redact, AuthEvent, Credential, SessionState};
use crate::cache::CredentialCache;
use crate::error::{AuthError, StorageError, StorageResult};
use crate::store::{
    LegacyStore, SecureStore, StoreExecutor, ACCESS_TOKEN_KEY, EXPIRES_AT_KEY,
    LEGACY_ACCESS_TOKEN_KEY, LEGACY_USER_ID_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, USER_ID_KEY,
};

/// Extra time the coordinator allows beyond the refresh timeout before it
/// gives up on an operation
const SETTLE_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Tunables for the lifecycle manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Safety buffer subtracted from expiry for refresh decisions
    pub refresh_buffer: Duration,

    /// Upper bound on one AuthClient call
    pub refresh_timeout: std::time::Duration,

    /// Capacity of the event and auth-state channels
    pub event_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::seconds(300),
            refresh_timeout: std::time::Duration::from_secs(30),
            event_capacity: 64,
        }
    }
}

/// Result of a legacy storage migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No legacy store configured, or it holds no token
    NothingToMigrate,
    /// Secure storage already had a session; legacy keys were dropped
    AlreadyMigrated,
    /// Legacy session imported and legacy keys removed
    Migrated { user_id: i64 },
    /// Import failed; legacy keys left in place
    Failed(String),
}

/// Token lifecycle manager
///
/// Public façade over secure storage, the credential cache and the refresh
/// coordinator. Cheap to clone; clones share one session. Every operation
/// absorbs its errors: callers see `None`/`false` and bus events, never an
/// `Err`.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// Serialized secure store access
    store: StoreExecutor,

    /// Store imported once by `migrate_legacy_storage`
    legacy: Option<Arc<dyn LegacyStore>>,

    /// Current session snapshot
    cache: CredentialCache,

    /// Single in-flight refresh
    coordinator: RefreshCoordinator,

    /// Auth server
    client: Arc<dyn AuthClient>,

    /// Lifecycle events
    events: EventBus,

    settings: ManagerSettings,
}

impl TokenLifecycleManager {
    /// Create a manager over `store` and `client`
    ///
    /// The session starts empty; call [`restore_session`](Self::restore_session)
    /// to load what the store already holds.
    pub fn new(
        store: Arc<dyn SecureStore>,
        client: Arc<dyn AuthClient>,
        legacy: Option<Arc<dyn LegacyStore>>,
        settings: ManagerSettings,
    ) -> Result<Self> {
        let store = StoreExecutor::new(store).context("Failed to start secure store worker")?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                legacy,
                cache: CredentialCache::with_capacity(settings.event_capacity),
                coordinator: RefreshCoordinator::new(settings.refresh_timeout + SETTLE_GRACE),
                client,
                events: EventBus::new(settings.event_capacity),
                settings,
            }),
        })
    }

    /// Load the persisted session into the cache
    pub async fn restore_session(&self) -> bool {
        let cache = self.inner.cache.clone();

        let restored = self
            .inner
            .store
            .run(move |store| match load_credential(store) {
                Ok(Some(credential)) => {
                    tracing::info!(user_id = credential.user_id, "Restored persisted session");
                    cache.write(Some(credential));
                    true
                }
                Ok(None) => {
                    tracing::debug!("No persisted session");
                    cache.write(None);
                    false
                }
                Err(e @ StorageError::Corrupt { .. }) => {
                    tracing::warn!("Persisted session is corrupt, clearing: {}", e);
                    wipe(store);
                    cache.write(None);
                    false
                }
                Err(e) => {
                    tracing::warn!("Persisted session unreadable: {}", e);
                    cache.write(None);
                    false
                }
            })
            .await;

        restored.unwrap_or_else(|e| {
            tracing::error!("Secure store unavailable: {}", e);
            false
        })
    }

    /// Persist a new session and mark it authenticated
    ///
    /// All keys are written in one job; if any write fails the store and
    /// cache end up empty.
    pub async fn save_auth_data(
        &self,
        token: &str,
        user_id: i64,
        refresh_token: Option<&str>,
    ) -> bool {
        let credential =
            Credential::new(token, user_id).with_refresh_token(refresh_token.map(str::to_string));
        self.save_credential(credential).await
    }

    /// Persist a complete credential (including expiry)
    pub async fn save_credential(&self, credential: Credential) -> bool {
        let user_id = credential.user_id;
        let token = credential.access_token.clone();

        let cache = self.inner.cache.clone();
        let coordinator = self.inner.coordinator.clone();
        match self
            .inner
            .store
            .run(move |store| {
                let committed = commit(store, &cache, credential);
                // Runs after the cache write so no refresh can start from the
                // replaced session once this job is done
                coordinator.cancel(committed.is_ok().then_some(token));
                committed
            })
            .await
        {
            Ok(Ok(())) => {
                tracing::info!(user_id, "Saved credentials");
                true
            }
            Ok(Err(_)) => false,
            Err(e) => {
                tracing::error!("Secure store unavailable, credentials not saved: {}", e);
                self.inner.coordinator.cancel(None);
                false
            }
        }
    }

    /// Log in against the auth server and persist the grant
    pub async fn login(&self, username: &str, password: &str) -> bool {
        let timeout = self.inner.settings.refresh_timeout;

        let grant = match tokio::time::timeout(timeout, self.inner.client.login(username, password))
            .await
        {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                tracing::error!("Login failed: {}", e);
                return false;
            }
            Err(_) => {
                tracing::error!("Login failed: {}", AuthError::Timeout(timeout));
                return false;
            }
        };

        self.save_credential(Credential::from_grant(grant, None, Utc::now()))
            .await
    }

    /// Cached access token without freshness checks
    pub fn get_access_token(&self) -> Option<String> {
        self.session()
            .access_token()
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    }

    pub fn get_current_user_id(&self) -> Option<i64> {
        self.session().user_id()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_authenticated()
    }

    /// Snapshot of the current session
    pub fn session(&self) -> SessionState {
        self.inner.cache.read()
    }

    /// Access token that is valid beyond the safety buffer, refreshing if
    /// needed
    ///
    /// Concurrent callers share one refresh.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        match self.inner.precheck() {
            Precheck::Settled(token) => token,
            Precheck::Refresh => {
                tracing::debug!("Access token stale, requesting refresh");
                self.request_refresh().wait().await
            }
        }
    }

    /// `Bearer <token>` for a valid token
    pub async fn get_authorization_header(&self) -> Option<String> {
        self.get_valid_access_token()
            .await
            .map(|token| format!("Bearer {}", token))
    }

    /// Token exists and expires later than now plus the safety buffer
    pub fn is_token_valid(&self) -> bool {
        self.inner.is_token_valid(&self.session())
    }

    /// Token expiry is at or before now (no buffer)
    pub fn is_token_expired(&self) -> bool {
        self.session()
            .current()
            .map(|c| c.is_expired_at(Utc::now()))
            .unwrap_or(false)
    }

    /// Token expires at or before now plus `within`
    pub fn will_expire_soon(&self, within: Duration) -> bool {
        self.session()
            .current()
            .map(|c| c.expires_within(Utc::now(), within))
            .unwrap_or(false)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.session().current().and_then(|c| c.expires_at)
    }

    /// Refresh now, displacing any in-flight refresh
    pub async fn force_refresh(&self) -> Option<String> {
        if self.session().current().is_none() {
            tracing::debug!("No session to refresh");
            return None;
        }

        let inner = self.inner.clone();
        self.inner
            .coordinator
            .force_refresh(move |ticket| inner.run_refresh(ticket))
            .wait()
            .await
    }

    /// Delete every persisted key and reset the cache (idempotent)
    pub async fn clear_tokens(&self) {
        self.inner.clear(None).await;
    }

    /// Clear the session and announce the logout
    pub async fn logout(&self) {
        self.clear_tokens().await;
        tracing::info!("User logged out");
        self.inner.events.emit(AuthEvent::UserDidLogout);
    }

    /// Import a session from the legacy store, once
    ///
    /// Never fatal. Legacy keys are removed only after the secure store holds
    /// the session.
    pub async fn migrate_legacy_storage(&self) -> MigrationOutcome {
        let Some(legacy) = self.inner.legacy.clone() else {
            tracing::debug!("No legacy store configured");
            return MigrationOutcome::NothingToMigrate;
        };

        let cache = self.inner.cache.clone();
        let coordinator = self.inner.coordinator.clone();
        let outcome = self
            .inner
            .store
            .run(move |store| {
                let outcome = migrate(store, legacy.as_ref(), &cache);
                if matches!(outcome, MigrationOutcome::Migrated { .. }) {
                    coordinator.cancel(cache.read().access_token().map(str::to_string));
                }
                outcome
            })
            .await
            .unwrap_or_else(|e| MigrationOutcome::Failed(e.to_string()));

        match &outcome {
            MigrationOutcome::Migrated { user_id } => {
                tracing::info!(user_id, "Migrated legacy session to secure storage")
            }
            MigrationOutcome::AlreadyMigrated => {
                tracing::info!("Secure storage already holds a session, dropped legacy keys")
            }
            MigrationOutcome::NothingToMigrate => tracing::debug!("No legacy session found"),
            MigrationOutcome::Failed(reason) => {
                tracing::warn!("Legacy migration failed: {}", reason)
            }
        }

        outcome
    }

    /// Receive every authenticated-state transition
    pub fn subscribe_auth_state(&self) -> broadcast::Receiver<bool> {
        self.inner.cache.subscribe()
    }

    /// Receive lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.coordinator.state()
    }

    /// Number of refresh operations started so far
    pub fn refresh_operations_started(&self) -> u64 {
        self.inner.coordinator.operations_started()
    }

    fn request_refresh(&self) -> RefreshHandle {
        let checker = self.inner.clone();
        let inner = self.inner.clone();
        self.inner.coordinator.request_refresh_unless(
            move || checker.precheck(),
            move |ticket| inner.run_refresh(ticket),
        )
    }
}

impl Inner {
    fn is_token_valid(&self, state: &SessionState) -> bool {
        state
            .current()
            .map(|c| !c.access_token.is_empty() && c.is_valid_at(Utc::now(), self.settings.refresh_buffer))
            .unwrap_or(false)
    }

    /// Decide from the cache alone whether a refresh is needed
    fn precheck(&self) -> Precheck {
        let state = self.cache.read();
        match state.current() {
            None => Precheck::Settled(None),
            Some(credential) if self.is_token_valid(&state) => {
                Precheck::Settled(Some(credential.access_token.clone()))
            }
            Some(_) => Precheck::Refresh,
        }
    }

    /// Body of one refresh operation: call the auth server, then commit or
    /// clear
    async fn run_refresh(self: Arc<Self>, ticket: RefreshTicket) -> Option<String> {
        let previous = self.cache.read().current().cloned();
        let refresh_token = previous.as_ref().and_then(|c| c.refresh_token.clone());

        let Some(refresh_token) = refresh_token else {
            return self.fail_refresh(ticket, AuthError::NoRefreshToken).await;
        };

        tracing::debug!(operation_id = ticket.id(), "Refreshing access token...");

        let timeout = self.settings.refresh_timeout;
        let grant = match tokio::time::timeout(timeout, self.client.refresh(&refresh_token)).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => return self.fail_refresh(ticket, e).await,
            Err(_) => return self.fail_refresh(ticket, AuthError::Timeout(timeout)).await,
        };

        let credential = Credential::from_grant(grant, Some(refresh_token), Utc::now());
        let token = credential.access_token.clone();
        let user_id = credential.user_id;

        let cache = self.cache.clone();
        let coordinator = self.coordinator.clone();
        let committed = self
            .store
            .run(move |store| {
                if !coordinator.is_current(ticket) {
                    return Ok(false);
                }
                commit(store, &cache, credential).map(|_| true)
            })
            .await;

        match committed {
            Ok(Ok(true)) => {
                tracing::info!(
                    operation_id = ticket.id(),
                    user_id,
                    "Token refreshed (token: {})",
                    redact(&token)
                );
                self.events.emit(AuthEvent::TokenDidRefresh);
                Some(token)
            }
            Ok(Ok(false)) => {
                tracing::debug!(operation_id = ticket.id(), "Refresh superseded, not committed");
                None
            }
            Ok(Err(e)) => self.fail_refresh(ticket, e.into()).await,
            Err(e) => self.fail_refresh(ticket, e.into()).await,
        }
    }

    /// Failure policy: a failed refresh always ends the session
    async fn fail_refresh(&self, ticket: RefreshTicket, err: AuthError) -> Option<String> {
        if !self.coordinator.is_current(ticket) {
            tracing::debug!(
                operation_id = ticket.id(),
                "Superseded refresh failed, session untouched: {}",
                err
            );
            return None;
        }

        tracing::error!(
            operation_id = ticket.id(),
            "Token refresh failed, clearing credentials: {}",
            err
        );

        if self.clear(Some(ticket)).await {
            self.events.emit(AuthEvent::TokenRefreshFailed);
            self.events.emit(AuthEvent::UserDidLogout);
        }

        None
    }

    /// Wipe store and cache; with `owner`, only while that refresh is still
    /// current, otherwise also detach any in-flight refresh
    async fn clear(&self, owner: Option<RefreshTicket>) -> bool {
        let cache = self.cache.clone();
        let coordinator = self.coordinator.clone();

        let cleared = self
            .store
            .run(move |store| {
                if let Some(ticket) = owner {
                    if !coordinator.is_current(ticket) {
                        return false;
                    }
                }
                wipe(store);
                cache.write(None);
                if owner.is_none() {
                    coordinator.cancel(None);
                }
                true
            })
            .await;

        match cleared {
            Ok(done) => done,
            Err(e) => {
                // The worker is gone; nothing else can write the cache now
                tracing::error!("Secure store unavailable while clearing: {}", e);
                self.cache.write(None);
                if owner.is_none() {
                    self.coordinator.cancel(None);
                }
                true
            }
        }
    }
}

/// Write every session key; optional values that are absent are deleted
fn persist_credential(store: &dyn SecureStore, credential: &Credential) -> StorageResult<()> {
    store.put(ACCESS_TOKEN_KEY, &credential.access_token)?;

    match &credential.refresh_token {
        Some(refresh_token) => store.put(REFRESH_TOKEN_KEY, refresh_token)?,
        None => store.delete(REFRESH_TOKEN_KEY)?,
    }

    store.put(USER_ID_KEY, &credential.user_id.to_string())?;

    match credential.expires_at {
        Some(expires_at) => store.put(EXPIRES_AT_KEY, &expires_at.to_rfc3339())?,
        None => store.delete(EXPIRES_AT_KEY)?,
    }

    Ok(())
}

/// Persist then publish; any write failure rolls back to an empty session
fn commit(store: &dyn SecureStore, cache: &CredentialCache, credential: Credential) -> StorageResult<()> {
    match persist_credential(store, &credential) {
        Ok(()) => {
            cache.write(Some(credential));
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Persisting credentials failed, rolling back: {}", e);
            wipe(store);
            cache.write(None);
            Err(e)
        }
    }
}

/// Best-effort delete of every session key
fn wipe(store: &dyn SecureStore) {
    for key in SESSION_KEYS {
        if let Err(e) = store.delete(key) {
            tracing::warn!(key, "Failed to delete secure store key: {}", e);
        }
    }
}

fn load_credential(store: &dyn SecureStore) -> StorageResult<Option<Credential>> {
    let Some(access_token) = store.get(ACCESS_TOKEN_KEY)? else {
        return Ok(None);
    };

    let raw_user_id = store.get(USER_ID_KEY)?.ok_or_else(|| StorageError::Corrupt {
        key: USER_ID_KEY.to_string(),
        reason: "missing while an access token is stored".to_string(),
    })?;
    let user_id = raw_user_id
        .trim()
        .parse::<i64>()
        .map_err(|e| StorageError::Corrupt {
            key: USER_ID_KEY.to_string(),
            reason: e.to_string(),
        })?;

    let refresh_token = store.get(REFRESH_TOKEN_KEY)?;

    let expires_at = store
        .get(EXPIRES_AT_KEY)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StorageError::Corrupt {
                    key: EXPIRES_AT_KEY.to_string(),
                    reason: e.to_string(),
                })
        })
        .transpose()?;

    Ok(Some(
        Credential::new(access_token, user_id)
            .with_refresh_token(refresh_token)
            .with_expires_at(expires_at),
    ))
}

fn migrate(
    store: &dyn SecureStore,
    legacy: &dyn LegacyStore,
    cache: &CredentialCache,
) -> MigrationOutcome {
    let access_token = match legacy.read(LEGACY_ACCESS_TOKEN_KEY) {
        Ok(Some(token)) if !token.is_empty() => token,
        Ok(_) => return MigrationOutcome::NothingToMigrate,
        Err(e) => return MigrationOutcome::Failed(e.to_string()),
    };

    if store.contains(ACCESS_TOKEN_KEY) {
        remove_legacy_keys(legacy);
        return MigrationOutcome::AlreadyMigrated;
    }

    let user_id = match legacy.read(LEGACY_USER_ID_KEY) {
        Ok(Some(raw)) => match raw.trim().parse::<i64>() {
            Ok(user_id) => user_id,
            Err(e) => return MigrationOutcome::Failed(format!("invalid legacy user id: {}", e)),
        },
        Ok(None) => return MigrationOutcome::Failed("legacy user id missing".to_string()),
        Err(e) => return MigrationOutcome::Failed(e.to_string()),
    };

    if let Err(e) = commit(store, cache, Credential::new(access_token, user_id)) {
        return MigrationOutcome::Failed(e.to_string());
    }

    remove_legacy_keys(legacy);
    MigrationOutcome::Migrated { user_id }
}

fn remove_legacy_keys(legacy: &dyn LegacyStore) {
    for key in [LEGACY_ACCESS_TOKEN_KEY, LEGACY_USER_ID_KEY] {
        if let Err(e) = legacy.remove(key) {
            tracing::warn!(key, "Failed to remove legacy key: {}", e);
        }
    }
}
