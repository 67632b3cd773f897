//! wgswap VPN - Provider-side Key Rotation
//!
//! Everything needed to obtain a fresh WireGuard peer from the provider:
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌────────────┐   ┌───────────────┐
//! │  KeyPair   │──▶│ ServerSelector │──▶│ AuthClient │──▶│ KeyRegistrar  │
//! │ (X25519)   │   │  (directory)   │   │  (token)   │   │ (pinned TLS)  │
//! └────────────┘   └────────────────┘   └────────────┘   └───────┬───────┘
//!                                                                │
//!                                                                ▼
//!                                                          PeerConfig
//! ```
//!
//! # Security
//!
//! - Private keys are clamped X25519 scalars from the OS entropy source
//! - Registration verifies the server certificate against its CN while the
//!   TCP connection goes to the IP chosen from the directory
//! - Passwords, tokens and private keys are redacted from `Debug` output

mod auth;
mod config;
mod directory;
mod keys;
mod registrar;

pub use auth::{AuthClient, AuthError, Credentials, ProviderToken, DEFAULT_TOKEN_URL};
pub use config::{Endpoint, PeerConfig};
pub use directory::{
    parse_attempts, Directory, RegionEntry, SelectError, SelectorConfig, ServerFilter,
    ServerRecord, ServerSelector, DEFAULT_ATTEMPTS, DEFAULT_DIRECTORY_URL, FALLBACK_ATTEMPTS,
    MATCH_ANY,
};
pub use keys::{clamp, KeyError, KeyPair, PrivateKey, PublicKey};
pub use registrar::{
    KeyRegistrar, RegistrarConfig, RegistrationError, REGISTRATION_PATH, REGISTRATION_PORT,
};
