//! Credential store: per-application TLS client identity and backend environment.
//!
//! Append-only for the life of the process. A second `put` for an id that already exists
//! is accepted and ignored, so the first credential (and the session built from it) wins.

use crate::error::{PushError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Backend environment a credential is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            other => Err(PushError::invalid(format!(
                "unknown environment {:?} (expected sandbox or production)",
                other
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed client certificate chain and key.
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    /// Parse a PEM blob holding the certificate chain and the private key (any order).
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let cert_chain = rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PushError::invalid(format!("reading certificate PEM: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(PushError::invalid("credential contains no certificate"));
        }
        let key = rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| PushError::invalid(format!("reading private key PEM: {}", e)))?
            .ok_or_else(|| PushError::invalid("credential contains no private key"))?;
        Ok(Self { cert_chain, key })
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

/// Everything needed to open connections for one application.
pub struct AppCredential {
    pub app_id: String,
    pub environment: Environment,
    pub connect_timeout: Duration,
    pub identity: ClientIdentity,
}

impl AppCredential {
    pub fn from_pem(
        app_id: impl Into<String>,
        pem: &[u8],
        environment: Environment,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let app_id = app_id.into();
        if app_id.trim().is_empty() {
            return Err(PushError::invalid("app id is empty"));
        }
        Ok(Self {
            app_id,
            environment,
            connect_timeout,
            identity: ClientIdentity::from_pem(pem)?,
        })
    }
}

impl fmt::Debug for AppCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredential")
            .field("app_id", &self.app_id)
            .field("environment", &self.environment)
            .field("connect_timeout", &self.connect_timeout)
            .field("certificates", &self.identity.cert_chain.len())
            .finish()
    }
}

/// In-memory credential map shared by the registry and the service.
pub struct CredentialStore {
    inner: Arc<RwLock<HashMap<String, Arc<AppCredential>>>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store iff absent. Returns true when a new entry was created.
    pub async fn put(&self, credential: AppCredential) -> bool {
        let mut g = self.inner.write().await;
        if g.contains_key(&credential.app_id) {
            return false;
        }
        g.insert(credential.app_id.clone(), Arc::new(credential));
        true
    }

    pub async fn get(&self, app_id: &str) -> Result<Arc<AppCredential>> {
        self.inner
            .read()
            .await
            .get(app_id)
            .cloned()
            .ok_or_else(|| PushError::NotProvisioned(app_id.to_string()))
    }

    pub async fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Self-signed client certificate + key as one PEM blob.
    pub fn client_pem(name: &str) -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        format!("{}{}", cert.pem(), key.serialize_pem())
    }

    pub fn credential(app_id: &str, environment: Environment) -> AppCredential {
        AppCredential::from_pem(
            app_id,
            client_pem(app_id).as_bytes(),
            environment,
            Duration::from_secs(5),
        )
        .unwrap()
    }
}
