//! Key Registration
//!
//! Registers a WireGuard public key with the selected server and receives
//! the peer configuration it assigns.
//!
//! The server is reached by its already-selected IP while TLS verifies the
//! certificate against the server's CN:
//!
//! ```text
//!   URL      https://<cn>:1337/addKey?pt=<token>&pubkey=<key>
//!   TCP      <ip>:1337             (pinned, no DNS lookup)
//!   TLS SNI  <cn>                  (certificate must be issued for cn)
//! ```

use crate::auth::ProviderToken;
use crate::config::{PeerConfig, RegistrationResponse};
use crate::directory::ServerRecord;
use crate::keys::PublicKey;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use url::Url;
use wgswap_net::{HttpClient, HttpClientConfig, PinnedEndpoint, StatusCode};

/// Port the registration API listens on
pub const REGISTRATION_PORT: u16 = 1337;

/// Registration API path
pub const REGISTRATION_PATH: &str = "/addKey";

/// Registration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistrationError {
    #[error("Failed to prepare registration client: {0}")]
    Client(String),

    #[error("Failed to send registration request: {0}")]
    Transport(String),

    #[error("Unexpected registration response: {status} - {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to decode registration response: {0}")]
    ResponseFormat(String),
}

/// Registrar configuration
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// URL scheme (`https` in production)
    pub scheme: String,
    /// Registration port
    pub port: u16,
    /// Extra trust anchors for the provider's private CA
    pub ca_bundle: Option<PathBuf>,
    /// Timeouts and limits for the pinned client
    pub http: HttpClientConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            port: REGISTRATION_PORT,
            ca_bundle: None,
            http: HttpClientConfig::default(),
        }
    }
}

/// Registers public keys with provider servers
pub struct KeyRegistrar {
    config: RegistrarConfig,
}

impl KeyRegistrar {
    /// Create a new registrar
    pub fn new(config: RegistrarConfig) -> Self {
        Self { config }
    }

    /// Build the registration URL for a server
    pub fn registration_url(
        &self,
        server: &ServerRecord,
        token: &ProviderToken,
        public_key: &PublicKey,
    ) -> Result<Url, RegistrationError> {
        let base = format!(
            "{}://{}:{}{}",
            self.config.scheme, server.cn, self.config.port, REGISTRATION_PATH
        );
        let mut url = Url::parse(&base)
            .map_err(|e| RegistrationError::Client(format!("invalid server name '{}': {}", server.cn, e)))?;

        url.query_pairs_mut()
            .append_pair("pt", token.as_str())
            .append_pair("pubkey", &public_key.to_base64());

        Ok(url)
    }

    /// Dial pin tying the URL's host to the selected IP
    pub fn pinned_endpoint(&self, url: &Url, server: &ServerRecord) -> Result<PinnedEndpoint, RegistrationError> {
        let identity = url.host_str()
            .ok_or_else(|| RegistrationError::Client("registration URL has no host".to_string()))?;

        Ok(PinnedEndpoint::new(identity, self.config.port, server.ip))
    }

    /// Register `public_key` with `server`
    pub async fn register(
        &self,
        server: &ServerRecord,
        token: &ProviderToken,
        public_key: &PublicKey,
    ) -> Result<PeerConfig, RegistrationError> {
        let url = self.registration_url(server, token, public_key)?;
        let pin = self.pinned_endpoint(&url, server)?;

        let http_config = HttpClientConfig {
            ca_bundle: self.config.ca_bundle.clone(),
            ..self.config.http.clone()
        };
        let client = HttpClient::new(http_config)
            .map_err(|e| RegistrationError::Client(e.to_string()))?
            .with_pin(pin);

        debug!("Registering key {:?} with {} via {}", public_key, server.cn, server.ip);

        let response = client.get(url.as_str()).await
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;

        if response.status != StatusCode::OK {
            return Err(RegistrationError::Rejected {
                status: response.status.as_u16(),
                body: response.text_lossy(),
            });
        }

        let wire: RegistrationResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RegistrationError::ResponseFormat(e.to_string()))?;
        let peer = PeerConfig::from(wire);

        if !peer.is_ok() {
            warn!("Server {} reported status '{}'", server.cn, peer.status);
        }

        info!(
            "Key registered with {} (endpoint: {}, address: {})",
            server.cn, peer.endpoint, peer.peer_ip
        );
        Ok(peer)
    }
}
