// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on a server-declared token lifetime (10 years)
const MAX_GRANT_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Immutable credential set for one authenticated session
///
/// Replaced wholesale on every refresh, never mutated field by field.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, user_id: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            user_id,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        self.refresh_token = refresh_token;
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Build the credential that replaces the current one after a grant
    ///
    /// Servers that do not rotate refresh tokens omit it; the previous one
    /// stays in use.
    pub fn from_grant(
        grant: TokenGrant,
        previous_refresh_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = grant
            .expires_in
            .map(|secs| now + Duration::seconds(secs.min(MAX_GRANT_LIFETIME_SECS) as i64));

        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh_token),
            user_id: grant.user_id,
            expires_at,
        }
    }

    /// Usable at `now` with `buffer` of headroom; no known expiry counts as usable
    pub fn is_valid_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(exp) => exp > now + buffer,
        }
    }

    /// Strictly past expiry, no buffer
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// Expires at or before `now + within`
    pub fn expires_within(&self, now: DateTime<Utc>, within: Duration) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now + within)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redact(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(redact),
            )
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Short, log-safe prefix of a secret
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    format!("{}...", prefix)
}

/// Snapshot of the current session held by the credential cache
///
/// `is_authenticated` is derived from `current` and cannot drift from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    current: Option<Credential>,
    is_authenticated: bool,
}

impl SessionState {
    pub fn new(current: Option<Credential>) -> Self {
        let is_authenticated = current
            .as_ref()
            .map(|c| !c.access_token.is_empty())
            .unwrap_or(false);
        Self {
            current,
            is_authenticated,
        }
    }

    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn access_token(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.refresh_token.as_deref())
    }

    pub fn user_id(&self) -> Option<i64> {
        self.current.as_ref().map(|c| c.user_id)
    }
}

/// Token grant returned by the auth server on login or refresh
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: i64,
    pub expires_in: Option<u64>,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Session lifecycle events published on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthEvent {
    UserDidLogout,
    TokenDidRefresh,
    TokenRefreshFailed,
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            AuthEvent::UserDidLogout => "userDidLogout",
            AuthEvent::TokenDidRefresh => "tokenDidRefresh",
            AuthEvent::TokenRefreshFailed => "tokenRefreshFailed",
        };
        f.write_str(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential_expiring_in(secs: i64, now: DateTime<Utc>) -> Credential {
        Credential::new("token", 1).with_expires_at(Some(now + Duration::seconds(secs)))
    }

    #[test]
    fn test_validity_applies_buffer() {
        let now = Utc::now();
        let buffer = Duration::seconds(300);

        // 10 minutes left, 5 minute buffer
        assert!(credential_expiring_in(600, now).is_valid_at(now, buffer));
        // Inside the buffer
        assert!(!credential_expiring_in(250, now).is_valid_at(now, buffer));
        // Exactly on the buffer edge counts as stale
        assert!(!credential_expiring_in(300, now).is_valid_at(now, buffer));
    }

    #[test]
    fn test_missing_expiry_is_valid_and_never_expired() {
        let now = Utc::now();
        let credential = Credential::new("token", 1);
        assert!(credential.is_valid_at(now, Duration::seconds(300)));
        assert!(!credential.is_expired_at(now));
        assert!(!credential.expires_within(now, Duration::days(365)));
    }

    #[test]
    fn test_expired_check_has_no_buffer() {
        let now = Utc::now();
        assert!(!credential_expiring_in(250, now).is_expired_at(now));
        assert!(credential_expiring_in(0, now).is_expired_at(now));
        assert!(credential_expiring_in(-60, now).is_expired_at(now));
    }

    #[test]
    fn test_expires_within() {
        let now = Utc::now();
        let credential = credential_expiring_in(120, now);
        assert!(credential.expires_within(now, Duration::seconds(120)));
        assert!(credential.expires_within(now, Duration::seconds(600)));
        assert!(!credential.expires_within(now, Duration::seconds(60)));
    }

    #[test]
    fn test_from_grant_keeps_previous_refresh_token() {
        let now = Utc::now();
        let grant = TokenGrant {
            access_token: "new".to_string(),
            refresh_token: None,
            user_id: 42,
            expires_in: Some(3600),
        };

        let credential = Credential::from_grant(grant, Some("old-refresh".to_string()), now);
        assert_eq!(credential.access_token, "new");
        assert_eq!(credential.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(credential.user_id, 42);
        assert_eq!(credential.expires_at, Some(now + Duration::seconds(3600)));
    }

    #[test]
    fn test_from_grant_prefers_rotated_refresh_token() {
        let grant = TokenGrant {
            access_token: "new".to_string(),
            refresh_token: Some("rotated".to_string()),
            user_id: 42,
            expires_in: None,
        };

        let credential = Credential::from_grant(grant, Some("old".to_string()), Utc::now());
        assert_eq!(credential.refresh_token.as_deref(), Some("rotated"));
        assert_eq!(credential.expires_at, None);
    }

    #[test]
    fn test_session_state_invariant() {
        assert!(!SessionState::new(None).is_authenticated());
        assert!(!SessionState::new(Some(Credential::new("", 1))).is_authenticated());

        let state = SessionState::new(Some(
            Credential::new("abc", 42).with_refresh_token(Some("r".to_string())),
        ));
        assert!(state.is_authenticated());
        assert_eq!(state.access_token(), Some("abc"));
        assert_eq!(state.refresh_token(), Some("r"));
        assert_eq!(state.user_id(), Some(42));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = Credential::new("supersecretaccess", 1)
            .with_refresh_token(Some("supersecretrefresh".to_string()));
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("supersecretaccess"));
        assert!(!printed.contains("supersecretrefresh"));
        assert!(printed.contains("supers..."));
    }

    #[test]
    fn test_grant_deserializes_camel_case() {
        let grant: TokenGrant = serde_json::from_str(
            r#"{"accessToken":"a","refreshToken":"r","userId":7,"expiresIn":900}"#,
        )
        .unwrap();
        assert_eq!(grant.access_token, "a");
        assert_eq!(grant.refresh_token.as_deref(), Some("r"));
        assert_eq!(grant.user_id, 7);
        assert_eq!(grant.expires_in, Some(900));

        let grant: TokenGrant =
            serde_json::from_str(r#"{"accessToken":"a","userId":7}"#).unwrap();
        assert_eq!(grant.refresh_token, None);
        assert_eq!(grant.expires_in, None);
    }

    #[test]
    fn test_event_tags() {
        assert_eq!(AuthEvent::UserDidLogout.to_string(), "userDidLogout");
        assert_eq!(
            serde_json::to_string(&AuthEvent::TokenRefreshFailed).unwrap(),
            "\"tokenRefreshFailed\""
        );
    }
}
