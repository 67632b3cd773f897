//! Rotation Manager
//!
//! Runs one key rotation as a sequential pipeline:
//!
//! ```text
//! IDLE → KEY_GENERATED → SERVER_SELECTED → CONFIG_VALIDATED → TOKEN_ACQUIRED
//!      → KEY_REGISTERED → [SERVICE_STOPPED] → CONFIG_WRITTEN → [SERVICE_STARTED] → DONE
//! ```
//!
//! The settings row is validated with a placeholder payload before the
//! provider is contacted, so a wrong tag never burns a registration.

use crate::config::{ConfigError, RotationConfig};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgswap_net::{HttpClient, HttpError};
use wgswap_service::{ServiceError, ServiceManager};
use wgswap_store::{OutboundSettings, PeerSettings, SettingsStore, StoreError};
use wgswap_vpn::{
    AuthClient, AuthError, KeyError, KeyPair, KeyRegistrar, PeerConfig, PublicKey,
    RegistrationError, SelectError, ServerFilter, ServerRecord, ServerSelector,
};

/// Progress of a rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationState {
    Idle,
    KeyGenerated,
    ServerSelected,
    ConfigValidated,
    TokenAcquired,
    KeyRegistered,
    ServiceStopped,
    ConfigWritten,
    ServiceStarted,
    Done,
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationState::Idle => "IDLE",
            RotationState::KeyGenerated => "KEY_GENERATED",
            RotationState::ServerSelected => "SERVER_SELECTED",
            RotationState::ConfigValidated => "CONFIG_VALIDATED",
            RotationState::TokenAcquired => "TOKEN_ACQUIRED",
            RotationState::KeyRegistered => "KEY_REGISTERED",
            RotationState::ServiceStopped => "SERVICE_STOPPED",
            RotationState::ConfigWritten => "CONFIG_WRITTEN",
            RotationState::ServiceStarted => "SERVICE_STARTED",
            RotationState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Cause of a failed rotation
#[derive(Debug, thiserror::Error)]
pub enum RotationErrorKind {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create HTTP client: {0}")]
    Http(#[from] HttpError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// A failed rotation and the last state it reached
#[derive(Debug, thiserror::Error)]
#[error("rotation failed after reaching {state}")]
pub struct RotationError {
    pub state: RotationState,
    #[source]
    pub kind: RotationErrorKind,
}

/// Outcome of a successful rotation
#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub state: RotationState,
    pub server: ServerRecord,
    pub public_key: PublicKey,
    /// `None` on a dry run
    pub peer: Option<PeerConfig>,
    pub service_was_active: bool,
    pub service_restarted: bool,
}

/// Drives one rotation against a service manager
pub struct RotationManager<S> {
    config: RotationConfig,
    service: S,
    http: Arc<HttpClient>,
}

impl<S: ServiceManager> RotationManager<S> {
    /// Create a manager. Fails only if the HTTP client cannot be built.
    pub fn new(config: RotationConfig, service: S) -> Result<Self, RotationError> {
        let http = HttpClient::new(config.http_config()).map_err(|e| RotationError {
            state: RotationState::Idle,
            kind: e.into(),
        })?;

        Ok(Self {
            config,
            service,
            http: Arc::new(http),
        })
    }

    /// Run the rotation once
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        let mut state = RotationState::Idle;
        match self.run(&mut state).await {
            Ok(report) => Ok(report),
            Err(kind) => {
                warn!("Rotation failed at {}: {}", state, kind);
                Err(RotationError { state, kind })
            }
        }
    }

    async fn run(&self, state: &mut RotationState) -> Result<RotationReport, RotationErrorKind> {
        let config = &self.config;
        info!(
            "Rotating outbound '{}' (region: {}, unit: {}{})",
            config.tag,
            config.region,
            config.service,
            if config.dry_run { ", dry run" } else { "" }
        );

        // Credentials and filters are checked before anything touches the network
        let credentials = if config.dry_run { None } else { Some(config.credentials()?) };
        let filter = ServerFilter::new(config.filter_cn.as_deref(), config.filter_ip.as_deref())?;

        let keys = KeyPair::generate()?;
        advance(state, RotationState::KeyGenerated);
        debug!("New public key: {}", keys.public);

        let selector = ServerSelector::new(self.http.clone(), config.selector_config());
        let server = selector.select(&config.region, &filter).await?;
        advance(state, RotationState::ServerSelected);

        let mut store = SettingsStore::open(&config.db, config.settings_key.as_str())?;
        store.apply(&config.tag, &OutboundSettings::placeholder(keys.private.to_base64()), true)?;
        advance(state, RotationState::ConfigValidated);

        let Some(credentials) = credentials else {
            info!("Dry run complete, nothing registered or written");
            return Ok(RotationReport {
                state: *state,
                server,
                public_key: keys.public,
                peer: None,
                service_was_active: false,
                service_restarted: false,
            });
        };

        let auth = AuthClient::new(self.http.clone(), config.token_url.as_str());
        let token = auth.token(&credentials).await?;
        advance(state, RotationState::TokenAcquired);

        let registrar = KeyRegistrar::new(config.registrar_config());
        let peer = registrar.register(&server, &token, &keys.public).await?;
        advance(state, RotationState::KeyRegistered);

        let settings = self.outbound_settings(&keys, &peer);

        let unit = config.service.as_str();
        let was_active = match self.service.is_active(unit).await {
            Ok(active) => active,
            Err(e) => {
                warn!("Could not query {}, assuming inactive: {}", unit, e);
                false
            }
        };

        if was_active {
            self.service.stop(unit).await?;
            advance(state, RotationState::ServiceStopped);
        } else {
            debug!("{} is not active, leaving it stopped", unit);
        }

        if let Err(e) = store.apply(&config.tag, &settings, false) {
            if was_active {
                if let Err(start_err) = self.service.start(unit).await {
                    warn!("Failed to restart {} after failed write: {}", unit, start_err);
                }
            }
            return Err(e.into());
        }
        advance(state, RotationState::ConfigWritten);

        let mut restarted = false;
        if was_active {
            match self.service.start(unit).await {
                Ok(()) => {
                    restarted = true;
                    advance(state, RotationState::ServiceStarted);
                }
                Err(e) => warn!("Failed to start {}: {}", unit, e),
            }
        }

        advance(state, RotationState::Done);
        info!("Rotation complete: {} via {} ({})", config.tag, server.cn, peer.endpoint);

        Ok(RotationReport {
            state: *state,
            server,
            public_key: keys.public,
            peer: Some(peer),
            service_was_active: was_active,
            service_restarted: restarted,
        })
    }

    fn outbound_settings(&self, keys: &KeyPair, peer: &PeerConfig) -> OutboundSettings {
        let outbound = &self.config.outbound;
        OutboundSettings {
            secret_key: keys.private.to_base64(),
            address: vec![peer.client_cidr()],
            peers: vec![PeerSettings {
                public_key: peer.server_key.to_base64(),
                endpoint: peer.endpoint.to_string(),
                keep_alive: outbound.keep_alive,
            }],
            mtu: outbound.mtu,
            workers: outbound.workers,
            domain_strategy: outbound.domain_strategy.clone(),
        }
    }
}

fn advance(state: &mut RotationState, next: RotationState) {
    debug!("State {} -> {}", state, next);
    *state = next;
}
