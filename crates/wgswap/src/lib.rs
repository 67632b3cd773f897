//! wgswap: WireGuard Outbound Key Rotation
//!
//! Generates a fresh key pair, registers it with a provider server and
//! swaps the result into a proxy's SQLite-stored configuration, stopping and
//! restarting the proxy service around the write.

pub mod config;
pub mod rotation;

pub use config::{ConfigError, RotationConfig};
pub use rotation::{RotationError, RotationErrorKind, RotationManager, RotationReport, RotationState};
