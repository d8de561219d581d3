//! Session registry: at most one session per provisioned application.

use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::session::Session;
use crate::tls::Connector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// App id to session. Shared across the service and every RPC connection.
pub struct SessionRegistry {
    credentials: Arc<CredentialStore>,
    connector: Arc<dyn Connector>,
    inner: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new(credentials: Arc<CredentialStore>, connector: Arc<dyn Connector>) -> Self {
        Self {
            credentials,
            connector,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The app's session, created (unconnected) on first use. Concurrent first calls
    /// all get the same session. Fails with NotProvisioned when no credential exists.
    pub async fn get_or_create(&self, app_id: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.get(app_id).await {
            return Ok(session);
        }
        let credential = self.credentials.get(app_id).await?;
        let mut g = self.inner.write().await;
        let session = g
            .entry(app_id.to_string())
            .or_insert_with(|| {
                log::debug!("creating session for app {}", app_id);
                Arc::new(Session::new(credential, self.connector.clone()))
            })
            .clone();
        Ok(session)
    }

    pub async fn get(&self, app_id: &str) -> Option<Arc<Session>> {
        let g = self.inner.read().await;
        g.get(app_id).cloned()
    }

    /// Sessions sorted by app id.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let g = self.inner.read().await;
        let mut sessions: Vec<Arc<Session>> = g.values().cloned().collect();
        sessions.sort_by(|a, b| a.app_id().cmp(b.app_id()));
        sessions
    }

    pub async fn close_all(&self) {
        for session in self.snapshot().await {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::test_support::credential;
    use crate::credentials::{AppCredential, Environment};
    use crate::session::SessionState;
    use crate::tls::{BoxStream, Service};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        fn endpoint(&self, _credential: &AppCredential, _service: Service) -> String {
            "unreachable:0".to_string()
        }

        async fn connect(
            &self,
            _credential: &AppCredential,
            _service: Service,
        ) -> std::io::Result<BoxStream> {
            Err(std::io::ErrorKind::ConnectionRefused.into())
        }
    }

    async fn registry() -> SessionRegistry {
        let store = Arc::new(CredentialStore::new());
        store.put(credential("app", Environment::Production)).await;
        SessionRegistry::new(store, Arc::new(Unreachable))
    }

    #[tokio::test]
    async fn unknown_app_is_not_provisioned() {
        let registry = registry().await;
        let err = registry.get_or_create("other").await.err().unwrap();
        assert_eq!(err.kind(), "NotProvisioned");
        assert!(registry.get("other").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_first_use_yields_one_session() {
        let registry = Arc::new(registry().await);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let r = registry.clone();
            handles.push(tokio::spawn(async move { r.get_or_create("app").await.unwrap() }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.snapshot().await.len(), 1);
        assert_eq!(sessions[0].state().await, SessionState::Unprovisioned);
        assert_eq!(sessions[0].environment(), Environment::Production);
    }

    #[tokio::test]
    async fn close_all_closes_sessions() {
        let registry = registry().await;
        let session = registry.get_or_create("app").await.unwrap();
        registry.close_all().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }
}
