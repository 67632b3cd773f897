//! wgswap: WireGuard Outbound Key Rotation
//!
//! Main entry point. Sets up logging, layers the configuration and runs one
//! rotation. The resulting peer configuration is printed on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wgswap::{RotationConfig, RotationManager};
use wgswap_service::Systemctl;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wgswap")]
#[command(version, about = "Rotate the WireGuard key of a proxy outbound")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider account username
    #[arg(long, env = "WGSWAP_USERNAME")]
    username: Option<String>,

    /// Provider account password
    #[arg(long, env = "WGSWAP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Region identifier
    #[arg(long)]
    region: Option<String>,

    /// Regex the server CN must match
    #[arg(long)]
    filter_cn: Option<String>,

    /// Regex the server IP must match
    #[arg(long)]
    filter_ip: Option<String>,

    /// Directory fetch attempts
    #[arg(long)]
    retry_count: Option<String>,

    /// Outbound tag to update
    #[arg(long)]
    tag: Option<String>,

    /// CA bundle for the registration endpoint (empty to disable)
    #[arg(long)]
    cert: Option<String>,

    /// Proxy settings database
    #[arg(long)]
    db: Option<PathBuf>,

    /// systemd unit to stop and start
    #[arg(long)]
    service: Option<String>,

    /// Settings row holding the proxy configuration
    #[arg(long)]
    settings_key: Option<String>,

    #[arg(long)]
    directory_url: Option<String>,

    #[arg(long)]
    token_url: Option<String>,

    #[arg(long)]
    mtu: Option<u32>,

    #[arg(long)]
    workers: Option<u32>,

    #[arg(long)]
    domain_strategy: Option<String>,

    /// Peer keep-alive in seconds
    #[arg(long)]
    keep_alive: Option<u32>,

    /// Select a server and validate the settings row, then stop
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, config: &mut RotationConfig) {
        if let Some(region) = self.region {
            config.region = region;
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(tag) = self.tag {
            config.tag = tag;
        }
        if let Some(cert) = self.cert {
            config.cert = cert;
        }
        if let Some(db) = self.db {
            config.db = db;
        }
        if let Some(service) = self.service {
            config.service = service;
        }
        if let Some(settings_key) = self.settings_key {
            config.settings_key = settings_key;
        }
        if let Some(directory_url) = self.directory_url {
            config.directory_url = directory_url;
        }
        if let Some(token_url) = self.token_url {
            config.token_url = token_url;
        }
        if self.username.is_some() {
            config.username = self.username;
        }
        if self.password.is_some() {
            config.password = self.password;
        }
        if self.filter_cn.is_some() {
            config.filter_cn = self.filter_cn;
        }
        if self.filter_ip.is_some() {
            config.filter_ip = self.filter_ip;
        }
        if self.mtu.is_some() {
            config.outbound.mtu = self.mtu;
        }
        if self.workers.is_some() {
            config.outbound.workers = self.workers;
        }
        if self.domain_strategy.is_some() {
            config.outbound.domain_strategy = self.domain_strategy;
        }
        if self.keep_alive.is_some() {
            config.outbound.keep_alive = self.keep_alive;
        }
        config.dry_run |= self.dry_run;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the report
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => RotationConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RotationConfig::default(),
    };
    cli.apply(&mut config);

    info!("wgswap starting (store: {}, tag: {})", config.db.display(), config.tag);

    let service = Systemctl::new(config.service_timeout());
    let manager = RotationManager::new(config, service)?;
    let report = manager.rotate().await?;

    match &report.peer {
        Some(peer) => println!("{}", serde_json::to_string_pretty(peer)?),
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}
