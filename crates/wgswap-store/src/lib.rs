//! wgswap Store - Proxy Configuration Persistence
//!
//! Rewrites one tagged WireGuard outbound inside the JSON document the proxy
//! panel keeps in its SQLite `settings` table.

mod document;
mod store;

pub use document::{
    compute_new_document, parse_document, render_document, rewrite_document, DocumentError,
    OutboundSettings, PeerSettings,
};
pub use store::{ApplyOutcome, SettingsStore, StoreError, DEFAULT_SETTINGS_KEY};
