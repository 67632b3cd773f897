//! Rotation Configuration
//!
//! Defaults, overlaid by an optional TOML file, overlaid by command-line
//! flags (applied in `main`).

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wgswap_net::HttpClientConfig;
use wgswap_service::DEFAULT_TIMEOUT;
use wgswap_store::DEFAULT_SETTINGS_KEY;
use wgswap_vpn::{
    parse_attempts, Credentials, RegistrarConfig, SelectorConfig, DEFAULT_DIRECTORY_URL,
    DEFAULT_TOKEN_URL, REGISTRATION_PORT,
};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Missing required setting '{0}'")]
    Missing(&'static str),
}

/// Registration endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationSection {
    pub scheme: String,
    pub port: u16,
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            port: REGISTRATION_PORT,
        }
    }
}

/// Timeouts, in seconds except where noted
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub service_secs: u64,
    pub http_secs: u64,
    pub connect_secs: u64,
    /// Pause between directory attempts (milliseconds)
    pub retry_delay_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            service_secs: DEFAULT_TIMEOUT.as_secs(),
            http_secs: 30,
            connect_secs: 10,
            retry_delay_ms: 1000,
        }
    }
}

/// Optional outbound fields; unset ones are left as stored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboundSection {
    pub mtu: Option<u32>,
    pub workers: Option<u32>,
    pub domain_strategy: Option<String>,
    pub keep_alive: Option<u32>,
}

/// Everything one rotation needs
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub region: String,
    pub filter_cn: Option<String>,
    pub filter_ip: Option<String>,
    /// Retry count as typed by the operator
    pub retry_count: String,
    pub tag: String,
    /// CA bundle path; empty disables the extra trust anchors
    pub cert: String,
    pub db: PathBuf,
    pub service: String,
    pub settings_key: String,
    pub directory_url: String,
    pub token_url: String,
    pub dry_run: bool,
    pub registration: RegistrationSection,
    pub timeouts: TimeoutSection,
    pub outbound: OutboundSection,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            region: "turkey".to_string(),
            filter_cn: None,
            filter_ip: None,
            retry_count: "3".to_string(),
            tag: "wg-proton-tr23".to_string(),
            cert: "ca.rsa.4096.crt".to_string(),
            db: PathBuf::from("x-ui.db"),
            service: "x-ui.service".to_string(),
            settings_key: DEFAULT_SETTINGS_KEY.to_string(),
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            dry_run: false,
            registration: RegistrationSection::default(),
            timeouts: TimeoutSection::default(),
            outbound: OutboundSection::default(),
        }
    }
}

impl RotationConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Account credentials; both must be non-empty
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = non_empty(self.username.as_deref()).ok_or(ConfigError::Missing("username"))?;
        let password = non_empty(self.password.as_deref()).ok_or(ConfigError::Missing("password"))?;
        Ok(Credentials::new(username, password))
    }

    pub fn attempts(&self) -> u32 {
        parse_attempts(&self.retry_count)
    }

    pub fn ca_bundle(&self) -> Option<PathBuf> {
        non_empty(Some(&self.cert)).map(PathBuf::from)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.service_secs)
    }

    /// Client settings for the directory and token endpoints
    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeouts.http_secs),
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
            ..HttpClientConfig::default()
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            directory_url: self.directory_url.clone(),
            attempts: self.attempts(),
            retry_delay: Duration::from_millis(self.timeouts.retry_delay_ms),
        }
    }

    pub fn registrar_config(&self) -> RegistrarConfig {
        RegistrarConfig {
            scheme: self.registration.scheme.clone(),
            port: self.registration.port,
            ca_bundle: self.ca_bundle(),
            http: self.http_config(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

impl fmt::Debug for RotationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("region", &self.region)
            .field("filter_cn", &self.filter_cn)
            .field("filter_ip", &self.filter_ip)
            .field("retry_count", &self.retry_count)
            .field("tag", &self.tag)
            .field("cert", &self.cert)
            .field("db", &self.db)
            .field("service", &self.service)
            .field("settings_key", &self.settings_key)
            .field("directory_url", &self.directory_url)
            .field("token_url", &self.token_url)
            .field("dry_run", &self.dry_run)
            .field("registration", &self.registration)
            .field("timeouts", &self.timeouts)
            .field("outbound", &self.outbound)
            .finish()
    }
}
