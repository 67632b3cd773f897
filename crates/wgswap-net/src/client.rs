//! HTTP Client with Pinned Dialing
//!
//! Uses hyper with tokio for HTTP/1.1.
//! Features:
//! - Automatic HTTPS with rustls (memory-safe TLS)
//! - Extra trust anchors loaded from a PEM CA bundle
//! - Per-authority dial pinning (connect to a fixed IP, verify the hostname)
//! - Request and connect timeouts, bounded response bodies

use crate::pin::{DialTarget, PinnedEndpoint};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),

    #[error("CA bundle {path}: {reason}")]
    CaBundle { path: PathBuf, reason: String },
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout (connect + TLS + response)
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
    /// PEM bundle whose certificates are trusted in addition to webpki-roots
    pub ca_bundle: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("wgswap/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 4 * 1024 * 1024, // 4 MB
            ca_bundle: None,
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Get body as string, replacing invalid UTF-8
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client with optional dial pins
pub struct HttpClient {
    /// Configuration
    config: HttpClientConfig,
    /// TLS connector sharing one rustls config
    tls: TlsConnector,
    /// Dial overrides
    pins: Vec<PinnedEndpoint>,
}

impl HttpClient {
    /// Create a new HTTP client
    ///
    /// Fails if a configured CA bundle cannot be read or holds no
    /// certificates.
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let roots = build_root_store(config.ca_bundle.as_deref())?;

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        info!(
            "HTTP client initialized (timeout: {:?}, extra CA: {})",
            config.timeout,
            config.ca_bundle.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "none".into())
        );

        Ok(Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
            pins: Vec::new(),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, HttpError> {
        Self::new(HttpClientConfig::default())
    }

    /// Add a dial pin
    pub fn with_pin(mut self, pin: PinnedEndpoint) -> Self {
        self.pins.push(pin);
        self
    }

    /// Get the active configuration
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Where a connection to `host:port` would be dialed
    pub fn dial_target(&self, host: &str, port: u16) -> DialTarget {
        DialTarget::resolve(&self.pins, host, port)
    }

    /// Perform a GET request
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url, None, None).await
    }

    /// Perform a form-encoded POST request
    pub async fn post_form(&self, url: &str, form: String) -> Result<Response, HttpError> {
        self.request(
            Method::POST,
            url,
            Some("application/x-www-form-urlencoded"),
            Some(form.into_bytes()),
        )
        .await
    }

    /// Perform an HTTP request bounded by the configured timeout
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        content_type: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        tokio::time::timeout(self.config.timeout, self.send(method, url, content_type, body))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        content_type: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        // 1. Parse URL
        let uri: Uri = url.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;

        let host = uri.host()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let is_https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(HttpError::InvalidUrl(format!("Unsupported scheme: {:?}", other)));
            }
        };
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let host_header = match uri.port_u16() {
            Some(p) => format!("{}:{}", host, p),
            None => host.clone(),
        };
        let path = uri.path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        // 2. Build request (origin-form target, explicit Host)
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, host_header)
            .header(USER_AGENT, &self.config.user_agent);
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        // 3. Dial (possibly pinned) and send
        let target = self.dial_target(&host, port);
        debug!("Dialing {} for {} {}", target, method, host);

        let stream = self.connect(&target).await?;
        let ttfb_start = Instant::now();

        let response = if is_https {
            let name = host.trim_start_matches('[').trim_end_matches(']').to_string();
            let server_name = ServerName::try_from(name)
                .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;

            let tls_stream = self.tls.connect(server_name, stream).await
                .map_err(|e| HttpError::TlsError(e.to_string()))?;

            send_request(TokioIo::new(tls_stream), request).await?
        } else {
            send_request(TokioIo::new(stream), request).await?
        };

        let ttfb = ttfb_start.elapsed();

        // 4. Read response
        let status = response.status();

        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body_bytes = collected.to_bytes().to_vec();

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?} TTFB)",
            method, url, status, body_bytes.len(), ttfb
        );

        Ok(Response {
            status,
            body: body_bytes,
        })
    }

    async fn connect(&self, target: &DialTarget) -> Result<TcpStream, HttpError> {
        let timeout = self.config.connect_timeout;
        let result = match target {
            DialTarget::Pinned(addr) => {
                tokio::time::timeout(timeout, TcpStream::connect(*addr)).await
            }
            DialTarget::Direct(authority) => {
                tokio::time::timeout(timeout, TcpStream::connect(authority.as_str())).await
            }
        };

        result
            .map_err(|_| HttpError::Timeout)?
            .map_err(|e| HttpError::ConnectionFailed(format!("{}: {}", target, e)))
    }
}

async fn send_request<T>(
    io: TokioIo<T>,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<Incoming>, HttpError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await
        .map_err(|e| HttpError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender.send_request(request).await
        .map_err(|e| HttpError::HttpError(e.to_string()))
}

/// webpki-roots plus every certificate in the optional bundle
fn build_root_store(ca_bundle: Option<&Path>) -> Result<RootCertStore, HttpError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let Some(path) = ca_bundle else {
        return Ok(root_store);
    };

    let bundle_error = |reason: String| HttpError::CaBundle {
        path: path.to_path_buf(),
        reason,
    };

    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| bundle_error(format!("{:?}", e)))?;

    let mut added = 0usize;
    for cert in certs {
        let cert = cert.map_err(|e| bundle_error(format!("{:?}", e)))?;
        root_store.add(cert)
            .map_err(|e| bundle_error(e.to_string()))?;
        added += 1;
    }

    if added == 0 {
        return Err(bundle_error("no certificates found".to_string()));
    }

    debug!("Added {} trust anchor(s) from {}", added, path.display());
    Ok(root_store)
}
