//! wgswap Network Layer
//!
//! Small HTTP/1.1 client used to talk to the VPN provider.
//!
//! Architecture:
//! 1. Request comes in → authority checked against dial pins
//! 2. If pinned → TCP dial goes to the pinned IP, TLS still verifies the hostname
//! 3. If not → system resolution, ordinary TLS
//! 4. Response body collected up to a size limit

mod client;
mod pin;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use pin::{DialTarget, PinnedEndpoint};
pub use hyper::StatusCode;
