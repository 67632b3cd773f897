//! Provider Server Directory
//!
//! Fetches the provider's published server list and picks one WireGuard
//! server for a region.
//!
//! # Retry Policy
//!
//! | Failure | Disposition |
//! |---------|-------------|
//! | transport / non-2xx / not JSON | retried up to the attempt budget |
//! | no matching server this attempt | retried up to the attempt budget |
//! | schema violation | fatal, not retried |
//! | invalid filter pattern | fatal, raised before any request |
//!
//! The directory is re-fetched on every attempt; nothing is cached.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wgswap_net::HttpClient;

/// Provider directory endpoint
pub const DEFAULT_DIRECTORY_URL: &str = "https://serverlist.piaservers.net/vpninfo/servers/v6";

/// Attempts used when no retry count is given
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Attempts used when the given retry count is not a positive integer
pub const FALLBACK_ATTEMPTS: u32 = 4;

/// Pattern used when a filter is not given
pub const MATCH_ANY: &str = ".+";

/// Parse an operator-supplied retry count.
///
/// Empty input selects [`DEFAULT_ATTEMPTS`]; anything that is not a positive
/// integer selects [`FALLBACK_ATTEMPTS`].
pub fn parse_attempts(raw: &str) -> u32 {
    let raw = raw.trim();
    if raw.is_empty() {
        return DEFAULT_ATTEMPTS;
    }
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
        _ => FALLBACK_ATTEMPTS,
    }
}

/// Server selection errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectError {
    #[error("Invalid {field} filter regex '{pattern}': {reason}")]
    Filter {
        field: &'static str,
        pattern: String,
        reason: String,
    },

    #[error("Failed to fetch server directory: {0}")]
    Fetch(String),

    #[error("Failed to decode server directory: {0}")]
    Decode(String),

    #[error("Server directory schema violation: {0}")]
    Schema(String),

    #[error("Region {region} not found or no server matched filters after {attempts} attempt(s)")]
    ServerNotFound {
        region: String,
        attempts: u32,
        last_error: Option<String>,
    },
}

impl SelectError {
    /// Can another attempt fix this?
    pub fn is_retryable(&self) -> bool {
        matches!(self, SelectError::Fetch(_) | SelectError::Decode(_))
    }
}

/// Top-level directory document
#[derive(Debug, Clone, Deserialize)]
pub struct Directory {
    /// All published regions
    pub regions: Vec<RegionEntry>,
}

/// One region of the directory
///
/// Only the region that is selected has its server groups validated.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionEntry {
    /// Region identifier (e.g. `turkey`)
    pub id: String,
    /// Server groups, kept raw until the region is selected
    #[serde(default)]
    servers: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ServerGroups {
    wg: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    ip: String,
    cn: String,
}

/// A WireGuard server picked from the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerRecord {
    /// Region the server is listed under
    pub region: String,
    /// Certificate common name (hostname identity)
    pub cn: String,
    /// Numeric address
    pub ip: IpAddr,
    /// Address exactly as the directory lists it; the IP filter runs on this
    #[serde(skip)]
    pub listed_ip: String,
}

impl Directory {
    /// Decode a directory body.
    ///
    /// Only the first JSON value is read; the provider appends a detached
    /// signature after it. Malformed JSON is a [`SelectError::Decode`],
    /// well-formed JSON with the wrong shape is a [`SelectError::Schema`].
    pub fn parse(body: &[u8]) -> Result<Self, SelectError> {
        let value = serde_json::Deserializer::from_slice(body)
            .into_iter::<serde_json::Value>()
            .next()
            .ok_or_else(|| SelectError::Decode("empty response body".to_string()))?
            .map_err(|e| SelectError::Decode(e.to_string()))?;

        serde_json::from_value(value)
            .map_err(|e| SelectError::Schema(e.to_string()))
    }

    /// Find region by ID
    pub fn region(&self, id: &str) -> Option<&RegionEntry> {
        self.regions.iter().find(|r| r.id == id)
    }
}

impl RegionEntry {
    /// WireGuard servers of this region, in listed order
    pub fn wireguard_servers(&self) -> Result<Vec<ServerRecord>, SelectError> {
        let raw = self.servers.clone()
            .ok_or_else(|| SelectError::Schema(format!("region '{}' has no 'servers'", self.id)))?;

        let groups: ServerGroups = serde_json::from_value(raw)
            .map_err(|e| SelectError::Schema(format!("region '{}': {}", self.id, e)))?;

        groups.wg
            .into_iter()
            .map(|s| {
                let ip = s.ip.parse().map_err(|_| {
                    SelectError::Schema(format!("region '{}': invalid ip '{}'", self.id, s.ip))
                })?;
                Ok(ServerRecord {
                    region: self.id.clone(),
                    cn: s.cn,
                    ip,
                    listed_ip: s.ip,
                })
            })
            .collect()
    }
}

/// Compiled CN / IP filters
#[derive(Debug, Clone)]
pub struct ServerFilter {
    cn: Regex,
    ip: Regex,
}

impl ServerFilter {
    /// Compile filters; `None` or empty patterns match anything
    pub fn new(cn: Option<&str>, ip: Option<&str>) -> Result<Self, SelectError> {
        Ok(Self {
            cn: compile("CN", cn)?,
            ip: compile("IP", ip)?,
        })
    }

    /// Filter that accepts every server
    pub fn any() -> Self {
        Self {
            cn: Regex::new(MATCH_ANY).expect("constant pattern"),
            ip: Regex::new(MATCH_ANY).expect("constant pattern"),
        }
    }

    /// Do both CN and IP satisfy their patterns?
    pub fn matches(&self, server: &ServerRecord) -> bool {
        self.cn.is_match(&server.cn) && self.ip.is_match(&server.listed_ip)
    }

    /// CN pattern source
    pub fn cn_pattern(&self) -> &str {
        self.cn.as_str()
    }

    /// IP pattern source
    pub fn ip_pattern(&self) -> &str {
        self.ip.as_str()
    }
}

fn compile(field: &'static str, pattern: Option<&str>) -> Result<Regex, SelectError> {
    let pattern = match pattern {
        Some(p) if !p.is_empty() => p,
        _ => MATCH_ANY,
    };
    Regex::new(pattern).map_err(|e| SelectError::Filter {
        field,
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Server selector configuration
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Directory URL
    pub directory_url: String,
    /// Maximum number of directory fetches
    pub attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Picks a server from the provider directory
pub struct ServerSelector {
    http: Arc<HttpClient>,
    config: SelectorConfig,
}

impl ServerSelector {
    /// Create a new selector
    pub fn new(http: Arc<HttpClient>, config: SelectorConfig) -> Self {
        Self { http, config }
    }

    /// Compile the patterns, then select. Invalid patterns fail before any
    /// request is made.
    pub async fn select_with(
        &self,
        region: &str,
        cn_filter: Option<&str>,
        ip_filter: Option<&str>,
    ) -> Result<ServerRecord, SelectError> {
        let filter = ServerFilter::new(cn_filter, ip_filter)?;
        self.select(region, &filter).await
    }

    /// Return the first server of `region` (in listed order) accepted by
    /// `filter`
    pub async fn select(
        &self,
        region: &str,
        filter: &ServerFilter,
    ) -> Result<ServerRecord, SelectError> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = None;

        info!(
            "Selecting server in '{}' (attempts: {}, cn: '{}', ip: '{}')",
            region,
            attempts,
            filter.cn_pattern(),
            filter.ip_pattern()
        );

        for attempt in 1..=attempts {
            match self.fetch().await {
                Ok(directory) => {
                    match directory.region(region) {
                        Some(entry) => {
                            for server in entry.wireguard_servers()? {
                                debug!("Attempt {}: candidate {} ({})", attempt, server.cn, server.ip);
                                if filter.matches(&server) {
                                    info!("Selected server {} ({})", server.cn, server.ip);
                                    return Ok(server);
                                }
                            }
                            debug!("Attempt {}: no server in '{}' matched filters", attempt, region);
                        }
                        None => debug!("Attempt {}: region '{}' not listed", attempt, region),
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!("Attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(SelectError::ServerNotFound {
            region: region.to_string(),
            attempts,
            last_error,
        })
    }

    /// Fetch and decode the directory once
    async fn fetch(&self) -> Result<Directory, SelectError> {
        let response = self.http.get(&self.config.directory_url).await
            .map_err(|e| SelectError::Fetch(e.to_string()))?;

        if !response.is_success() {
            return Err(SelectError::Fetch(format!("unexpected status {}", response.status)));
        }

        Directory::parse(&response.body)
    }
}
