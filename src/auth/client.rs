// Auth server client

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{redact, LoginRequest, RefreshRequest, TokenGrant};
use crate::error::{AuthError, AuthResult};

/// Network collaborator that performs login and refresh exchanges
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Exchange a refresh token for a new grant
    async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenGrant>;

    /// Exchange user credentials for a grant
    async fn login(&self, username: &str, password: &str) -> AuthResult<TokenGrant>;
}

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// JSON-over-HTTP auth client
pub struct HttpAuthClient {
    client: Client,
    base_url: String,
    user_agent: String,
}

impl HttpAuthClient {
    /// Create a client for the auth server at `base_url`
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AuthError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: format!(
                "session-keeper/{}-{}",
                env!("CARGO_PKG_VERSION"),
                get_machine_fingerprint()
            ),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_for_grant<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> AuthResult<TokenGrant> {
        let url = self.url(path);

        let response = self
            .client
            .post(&url)
            .header("User-Agent", &self.user_agent)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                "Auth request failed: url={}, status={}, body={}",
                url,
                status,
                error_text
            );

            // Prefer the server's error description when it sends one
            let message = serde_json::from_str::<serde_json::Value>(&error_text)
                .ok()
                .and_then(|json| {
                    json.get("error_description")
                        .or_else(|| json.get("error"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or(error_text);

            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse grant: {}", e)))?;

        if grant.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Response does not contain accessToken".to_string(),
            ));
        }

        Ok(grant)
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenGrant> {
        tracing::info!("Refreshing access token via {}", self.base_url);

        // 400/401 on refresh means the grant itself is no longer usable
        let grant = self
            .post_for_grant("/auth/refresh", &RefreshRequest { refresh_token })
            .await
            .map_err(|e| match e {
                AuthError::Rejected { status, message } if status == 400 || status == 401 => {
                    AuthError::RefreshFailed(message)
                }
                other => other,
            })?;

        tracing::info!(
            user_id = grant.user_id,
            expires_in = ?grant.expires_in,
            "Token refreshed (token: {})",
            redact(&grant.access_token)
        );

        Ok(grant)
    }

    async fn login(&self, username: &str, password: &str) -> AuthResult<TokenGrant> {
        tracing::info!("Logging in as {}", username);

        self.post_for_grant("/auth/login", &LoginRequest { username, password })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpAuthClient {
        HttpAuthClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(header_exists("user-agent"))
            .and(body_json(serde_json::json!({ "refreshToken": "r-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "a-2",
                "refreshToken": "r-2",
                "userId": 42,
                "expiresIn": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = client_for(&server).refresh("r-1").await.unwrap();
        assert_eq!(grant.access_token, "a-2");
        assert_eq!(grant.refresh_token.as_deref(), Some("r-2"));
        assert_eq!(grant.user_id, 42);
        assert_eq!(grant.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn test_refresh_revoked_grant_is_refresh_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r-1").await.unwrap_err();
        match err {
            AuthError::RefreshFailed(message) => assert_eq!(message, "refresh token revoked"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_rejection_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_credentials"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).login("scout", "wrong").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Rejected { status: 401, ref message } if message == "invalid_credentials"
        ));
    }

    #[tokio::test]
    async fn test_refresh_rejected_plain_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r-1").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Rejected { status: 503, ref message } if message == "maintenance"
        ));
    }

    #[tokio::test]
    async fn test_empty_access_token_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "",
                "userId": 1
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r-1").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r-1").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_login_posts_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(serde_json::json!({
                "username": "scout",
                "password": "hunter2"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "a-1",
                "refreshToken": "r-1",
                "userId": 7
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = client_for(&server).login("scout", "hunter2").await.unwrap();
        assert_eq!(grant.access_token, "a-1");
        assert_eq!(grant.user_id, 7);
        assert_eq!(grant.expires_in, None);
    }

    #[tokio::test]
    async fn test_trailing_slash_in_base_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "a",
                "userId": 1
            })))
            .mount(&server)
            .await;

        let client =
            HttpAuthClient::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        assert!(client.refresh("r").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let client =
            HttpAuthClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.refresh("r").await.unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
    }

    #[test]
    fn test_machine_fingerprint_is_stable() {
        assert_eq!(get_machine_fingerprint(), get_machine_fingerprint());
    }
}
