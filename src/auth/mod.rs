// Authentication module
// Manages the token lifecycle: cached credentials, refresh and persistence

mod client;
mod events;
mod manager;
mod refresh;
mod types;

pub use client::{AuthClient, HttpAuthClient};
pub use events::EventBus;
pub use manager::{ManagerSettings, MigrationOutcome, TokenLifecycleManager};
pub use refresh::{Precheck, RefreshCoordinator, RefreshHandle, RefreshState, RefreshTicket};
pub use types::{redact, AuthEvent, Credential, SessionState, TokenGrant};
