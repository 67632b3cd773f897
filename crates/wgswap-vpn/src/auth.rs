//! Provider Authentication
//!
//! Exchanges account credentials for a short-lived bearer token. The token
//! lives for one run and is never cached.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use url::form_urlencoded;
use wgswap_net::HttpClient;

/// Provider token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://www.privateinternetaccess.com/api/client/v2/token";

/// Authentication errors. None of these are retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Failed to fetch token: {0}")]
    Transport(String),

    #[error("Token request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to decode token response: {0}")]
    Decode(String),
}

/// Account credentials
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Form-encoded request body
    fn to_form(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("username", &self.username)
            .append_pair("password", &self.password)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Opaque bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderToken(String);

impl ProviderToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProviderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderToken([redacted])")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Token client
pub struct AuthClient {
    http: Arc<HttpClient>,
    token_url: String,
}

impl AuthClient {
    /// Create a new auth client
    pub fn new(http: Arc<HttpClient>, token_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: token_url.into(),
        }
    }

    /// Exchange credentials for a token
    pub async fn token(&self, credentials: &Credentials) -> Result<ProviderToken, AuthError> {
        debug!("Requesting token for {}", credentials.username);

        let response = self.http.post_form(&self.token_url, credentials.to_form()).await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status.as_u16(),
                body: response.text_lossy(),
            });
        }

        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| AuthError::Decode(e.to_string()))?;

        if parsed.token.is_empty() {
            return Err(AuthError::Decode("empty 'token' field".to_string()));
        }

        info!("Provider token acquired");
        Ok(ProviderToken(parsed.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AuthClient {
        let http = Arc::new(HttpClient::with_defaults().unwrap());
        AuthClient::new(http, format!("{}/api/client/v2/token", server.uri()))
    }

    #[test]
    fn test_form_is_encoded() {
        let creds = Credentials::new("p1234567", "pa&ss=word");
        assert_eq!(creds.to_form(), "username=p1234567&password=pa%26ss%3Dword");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("user", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));

        let token = ProviderToken::new("secret-token");
        assert!(!format!("{:?}", token).contains("secret-token"));
    }

    #[tokio::test]
    async fn test_token_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/v2/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("username=user&password=pass"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"abc123"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let token = client(&server).token(&Credentials::new("user", "pass")).await.unwrap();
        assert_eq!(token.as_str(), "abc123");
    }

    #[tokio::test]
    async fn test_token_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("HTTP Token: Access denied."))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).token(&Credentials::new("user", "bad")).await;
        match result {
            Err(AuthError::Rejected { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("Access denied"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"ok"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).token(&Credentials::new("user", "pass")).await;
        assert!(matches!(result, Err(AuthError::Decode(_))));
    }

    #[tokio::test]
    async fn test_token_transport_failure() {
        let http = Arc::new(HttpClient::with_defaults().unwrap());
        // Bind and release a port so nothing is listening on it
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let auth = AuthClient::new(http, format!("http://127.0.0.1:{}/token", port));

        let result = auth.token(&Credentials::new("user", "pass")).await;
        assert!(matches!(result, Err(AuthError::Transport(_))));
    }
}
