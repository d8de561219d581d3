//! TLS transport to the push backend.
//!
//! `Connector` is the seam sessions open sockets through. `TlsConnector` is the real
//! implementation: TCP connect to the endpoint for the credential's environment, then a
//! rustls client handshake presenting the application's certificate.

use crate::config::{EndpointsConfig, TlsConfig};
use crate::credentials::{AppCredential, ClientIdentity, Environment};
use crate::error::{PushError, Result};
use anyhow::Context;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream to the backend (TLS in production, in-memory pipes in tests).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Which backend service a connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Gateway,
    Feedback,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// `host:port` used for this credential and service; shown in errors and logs.
    fn endpoint(&self, credential: &AppCredential, service: Service) -> String;

    /// Open a connection and complete the handshake. Callers bound this with a timeout.
    async fn connect(
        &self,
        credential: &AppCredential,
        service: Service,
    ) -> std::io::Result<BoxStream>;

    /// Reject credentials the transport could never use. Called at provision time.
    fn check_identity(&self, _identity: &ClientIdentity) -> Result<()> {
        Ok(())
    }
}

pub struct TlsConnector {
    roots: Arc<RootCertStore>,
    endpoints: EndpointsConfig,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl TlsConnector {
    pub fn new(roots: RootCertStore, endpoints: EndpointsConfig) -> Self {
        Self {
            roots: Arc::new(roots),
            endpoints,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    fn client_config(&self, identity: &ClientIdentity) -> std::result::Result<rustls::ClientConfig, rustls::Error> {
        rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(identity.cert_chain.clone(), identity.key())
    }
}

#[async_trait]
impl Connector for TlsConnector {
    fn endpoint(&self, credential: &AppCredential, service: Service) -> String {
        endpoint_for(&self.endpoints, credential.environment, service).to_string()
    }

    async fn connect(
        &self,
        credential: &AppCredential,
        service: Service,
    ) -> std::io::Result<BoxStream> {
        let endpoint = endpoint_for(&self.endpoints, credential.environment, service);
        let host = endpoint
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(endpoint)
            .trim_start_matches('[')
            .trim_end_matches(']');
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let config = self
            .client_config(&credential.identity)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let tcp = TcpStream::connect(endpoint).await?;
        tcp.set_nodelay(true)?;
        let tls = tokio_rustls::TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await?;
        log::debug!(
            "tls handshake with {} complete for app {}",
            endpoint,
            credential.app_id
        );
        Ok(Box::new(tls))
    }

    fn check_identity(&self, identity: &ClientIdentity) -> Result<()> {
        self.client_config(identity)
            .map(|_| ())
            .map_err(|e| PushError::invalid(format!("unusable client credential: {}", e)))
    }
}

/// Endpoint for an environment and service from config.
pub fn endpoint_for(endpoints: &EndpointsConfig, environment: Environment, service: Service) -> &str {
    let env = match environment {
        Environment::Sandbox => &endpoints.sandbox,
        Environment::Production => &endpoints.production,
    };
    match service {
        Service::Gateway => &env.gateway,
        Service::Feedback => &env.feedback,
    }
}

/// Trust roots for backend certificates: platform roots (unless disabled) plus `tls.caFile`.
pub fn load_root_store(config: &TlsConfig) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if config.native_roots {
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                log::debug!("loaded {} native root(s), ignored {}", added, ignored);
            }
            Err(e) => log::warn!("loading native root certificates failed: {}", e),
        }
    }
    if let Some(ref path) = config.ca_file {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading CA file {}", path.display()))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.with_context(|| format!("parsing CA file {}", path.display()))?;
            roots
                .add(cert)
                .with_context(|| format!("adding CA from {}", path.display()))?;
        }
    }
    if roots.is_empty() {
        log::warn!("no trust roots configured; backend handshakes will fail");
    }
    Ok(roots)
}
