//! Push service: the operations the RPC layer exposes, over the credential store and
//! session registry.

use crate::codec::{self, DeviceToken, FeedbackRecord};
use crate::config::{Config, PushConfig};
use crate::credentials::{AppCredential, CredentialStore, Environment};
use crate::error::{PushError, Result};
use crate::registry::SessionRegistry;
use crate::session::SessionState;
use crate::tls::{self, Connector, TlsConnector};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Per-app view returned by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub app_id: String,
    pub environment: Environment,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct PushService {
    config: PushConfig,
    credentials: Arc<CredentialStore>,
    registry: SessionRegistry,
    connector: Arc<dyn Connector>,
}

impl PushService {
    pub fn new(config: PushConfig, connector: Arc<dyn Connector>) -> Self {
        let credentials = Arc::new(CredentialStore::new());
        let registry = SessionRegistry::new(credentials.clone(), connector.clone());
        Self {
            config,
            credentials,
            registry,
            connector,
        }
    }

    /// Service with the TLS connector and trust roots from config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let roots = tls::load_root_store(&config.tls)?;
        let connector = TlsConnector::new(roots, config.push.endpoints.clone());
        Ok(Self::new(config.push.clone(), Arc::new(connector)))
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// Register credentials for an app. Returns true when a new entry was created; a
    /// repeated provision for the same id is accepted and keeps the first credential.
    pub async fn provision(
        &self,
        app_id: &str,
        pem: &[u8],
        environment: &str,
        timeout_secs: Option<u64>,
    ) -> Result<bool> {
        let environment: Environment = environment.parse()?;
        let connect_timeout = Duration::from_secs(
            timeout_secs.unwrap_or(self.config.default_connect_timeout_secs),
        );
        if connect_timeout.is_zero() {
            return Err(PushError::invalid("connect timeout must be positive"));
        }
        let credential = AppCredential::from_pem(app_id, pem, environment, connect_timeout)?;
        self.connector.check_identity(&credential.identity)?;
        let created = self.credentials.put(credential).await;
        if created {
            log::info!("provisioned app {} ({})", app_id, environment);
        } else {
            log::debug!("app {} already provisioned; keeping existing credential", app_id);
        }
        Ok(created)
    }

    /// Send one notification per token. Everything is validated and framed before the
    /// session is touched; frames then go out contiguously and in order. Returns the
    /// number of frames written.
    pub async fn notify(
        &self,
        app_id: &str,
        tokens: &[String],
        payloads: &[serde_json::Value],
    ) -> Result<usize> {
        if tokens.len() != payloads.len() {
            return Err(PushError::invalid(format!(
                "got {} token(s) but {} notification(s)",
                tokens.len(),
                payloads.len()
            )));
        }
        let session = self.registry.get_or_create(app_id).await?;
        if tokens.is_empty() {
            return Ok(0);
        }

        let expiry = self.expiry();
        let frames = tokens
            .iter()
            .zip(payloads)
            .enumerate()
            .map(|(i, (token, payload))| {
                let token = DeviceToken::from_hex(token).map_err(|e| e.at_index(i))?;
                codec::encode_notification(
                    &token,
                    payload,
                    session.next_sequence_id(),
                    expiry,
                    self.config.max_payload_bytes,
                )
                .map_err(|e| e.at_index(i))
            })
            .collect::<Result<Vec<Bytes>>>()?;

        let timeout = self.config.call_timeout();
        let path = session.write_path(timeout).await?;
        path.ensure_connected(timeout)
            .await
            .map_err(|e| e.at_index(0))?;
        for (i, frame) in frames.iter().enumerate() {
            path.send_frame(frame, timeout)
                .await
                .map_err(|e| e.at_index(i))?;
        }
        log::debug!("app {}: sent {} notification(s)", app_id, frames.len());
        Ok(frames.len())
    }

    /// Drain the app's feedback stream. An empty list is a normal result.
    pub async fn feedback(&self, app_id: &str) -> Result<Vec<FeedbackRecord>> {
        let session = self.registry.get_or_create(app_id).await?;
        session.pull_feedback(self.config.feedback_timeout()).await
    }

    /// Every provisioned app, with the state of its session if one exists.
    pub async fn status(&self) -> Vec<AppStatus> {
        let mut out = Vec::new();
        for app_id in self.credentials.app_ids().await {
            let (environment, state) = match self.registry.get(&app_id).await {
                Some(session) => (session.environment(), session.state().await),
                None => match self.credentials.get(&app_id).await {
                    Ok(credential) => (credential.environment, SessionState::Unprovisioned),
                    Err(_) => continue,
                },
            };
            let reason = match &state {
                SessionState::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            out.push(AppStatus {
                app_id,
                environment,
                state: state.label().to_string(),
                reason,
            });
        }
        out
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        log::info!("push sessions closed");
    }

    fn expiry(&self) -> u32 {
        match self.config.notification_ttl_secs {
            Some(ttl) => {
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                u32::try_from(now + u64::from(ttl)).unwrap_or(u32::MAX)
            }
            None => 0,
        }
    }
}
