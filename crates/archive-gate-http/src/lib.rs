//! HTTP surface for the archive gateway
//!
//! NIST 800-53: SC-8 (Transmission Confidentiality), AC-3 (Access Enforcement)
//! Implementation: Explicit route table over `ArchiveGateway`, optional TLS
//! listener through rustls.

pub mod api;
pub mod error;
pub mod extract;

use archive_gate::config::{ServerConfig, TlsConfig};
use archive_gate::{ArchiveGateway, Config, Error, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use rustls::ServerConfig as RustlsServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Multipart framing allowance on top of the upload size cap
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Gateway every handler dispatches to
    pub gateway: Arc<ArchiveGateway>,
    /// Take the origin from `X-Forwarded-For`
    pub trust_forwarded_for: bool,
}

/// HTTP(S) listener
pub struct HttpServer {
    gateway: Arc<ArchiveGateway>,
    config: ServerConfig,
    upload_limit: usize,
}

impl HttpServer {
    /// Create a server for `gateway` with the listener and upload settings of `config`
    pub fn new(gateway: Arc<ArchiveGateway>, config: &Config) -> Self {
        let upload_limit = usize::try_from(config.upload.max_size)
            .unwrap_or(usize::MAX)
            .saturating_add(MULTIPART_OVERHEAD);
        Self {
            gateway,
            config: config.server.clone(),
            upload_limit,
        }
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.bind_address.parse().map_err(|e| {
            Error::Config(format!(
                "Invalid bind address {}: {e}",
                self.config.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.config.port))
    }

    /// Serve until the listener fails
    ///
    /// # Errors
    ///
    /// `Error::Config` for bad listener or TLS settings, `Error::Io` for bind failures
    pub async fn run(&self) -> Result<()> {
        let app = self.create_router();

        if let Some(tls_config) = &self.config.tls {
            return self.run_https(app, tls_config).await;
        }

        self.run_http(app).await
    }

    async fn run_http(&self, app: Router) -> Result<()> {
        let addr = self.bind_addr()?;
        info!("HTTP server listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }

    async fn run_https(&self, app: Router, tls_config: &TlsConfig) -> Result<()> {
        let rustls_config = Self::load_tls_config(tls_config)?;

        let addr = self.bind_addr()?;
        info!("HTTPS server listening on https://{}", addr);
        info!("  Certificate: {}", tls_config.cert_path.display());
        info!("  Private key: {}", tls_config.key_path.display());

        let tls_rustls_config =
            axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));

        axum_server::bind_rustls(addr, tls_rustls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        Ok(())
    }

    fn load_tls_config(tls_config: &TlsConfig) -> Result<RustlsServerConfig> {
        let cert_file = File::open(&tls_config.cert_path)
            .map_err(|e| Error::Config(format!("Failed to open certificate file: {e}")))?;
        let mut cert_reader = BufReader::new(cert_file);
        let cert_chain: Vec<_> = certs(&mut cert_reader)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Config(format!("Failed to parse certificate: {e}")))?;

        if cert_chain.is_empty() {
            return Err(Error::Config(
                "No certificates found in certificate file".to_string(),
            ));
        }

        let key_file = File::open(&tls_config.key_path)
            .map_err(|e| Error::Config(format!("Failed to open private key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let mut keys = pkcs8_private_keys(&mut key_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("Failed to parse private key: {e}")))?;

        if keys.is_empty() {
            return Err(Error::Config("No private keys found in key file".to_string()));
        }

        let private_key = keys.remove(0);

        RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key.into())
            .map_err(|e| Error::Config(format!("Failed to build TLS config: {e}")))
    }

    /// Route table
    pub fn create_router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            trust_forwarded_for: self.config.trust_forwarded_for,
        };

        Router::new()
            // Session endpoints
            .route("/auth/login", post(api::login))
            .route("/auth/logout", post(api::logout))
            .route("/auth/validate", get(api::validate))
            // Archive endpoints
            .route("/archive/search", get(api::search))
            .route("/archive/download", get(api::download))
            .route("/archive/content-search", post(api::content_search))
            .route(
                "/archive/upload",
                post(api::upload).layer(DefaultBodyLimit::max(self.upload_limit)),
            )
            .route("/archive/status", get(api::status))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}
