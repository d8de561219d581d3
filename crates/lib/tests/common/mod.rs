//! Shared fixtures for integration tests: a throwaway PKI and a local TLS backend that
//! records notification frames and serves a feedback stream.
#![allow(dead_code)]

use bytes::BytesMut;
use pushgate_core::codec::{self, FeedbackRecord, NotificationFrame};
use pushgate_core::config::{Config, EnvironmentEndpoints};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;

/// Test CA plus a server certificate for `localhost`.
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
    server_cert: CertificateDer<'static>,
    server_key: Vec<u8>,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().expect("ca key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "pushgate test ca");
        let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

        let server_key = KeyPair::generate().expect("server key");
        let mut server_params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .expect("server cert");

        Self {
            server_cert: server_cert.der().clone(),
            server_key: server_key.serialize_der(),
            ca_cert,
            ca_key,
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Client certificate and key, signed by the test CA, as one PEM blob.
    pub fn client_pem(&self, name: &str) -> String {
        let key = KeyPair::generate().expect("client key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("client params");
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("client cert");
        format!("{}{}", cert.pem(), key.serialize_pem())
    }

    fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).expect("add ca root");
        let verifier =
            rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .expect("client verifier");
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.clone()));
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.server_cert.clone()], key)
            .expect("server config");
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Local stand-in for the push backend: one port for notifications, one for feedback.
pub struct Backend {
    pub gateway_port: u16,
    pub feedback_port: u16,
    frames: Arc<Mutex<Vec<NotificationFrame>>>,
    feedback: Arc<Mutex<Vec<FeedbackRecord>>>,
    connections: Arc<AtomicUsize>,
}

impl Backend {
    pub async fn start(pki: &TestPki) -> Self {
        let acceptor = pki.acceptor();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let feedback = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let gateway = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
        let gateway_port = gateway.local_addr().expect("gateway addr").port();
        {
            let acceptor = acceptor.clone();
            let frames = frames.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((tcp, _)) = gateway.accept().await {
                    let acceptor = acceptor.clone();
                    let frames = frames.clone();
                    let connections = connections.clone();
                    tokio::spawn(async move {
                        let Ok(mut tls) = acceptor.accept(tcp).await else { return };
                        connections.fetch_add(1, Ordering::SeqCst);
                        let mut pending = BytesMut::new();
                        let mut buf = [0u8; 4096];
                        loop {
                            match tls.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    pending.extend_from_slice(&buf[..n]);
                                    let mut g = frames.lock().await;
                                    while let Some(frame) = codec::decode_notification(&mut pending) {
                                        g.push(frame);
                                    }
                                }
                            }
                        }
                    });
                }
            });
        }

        let feedback_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind feedback");
        let feedback_port = feedback_listener.local_addr().expect("feedback addr").port();
        {
            let feedback = feedback.clone();
            tokio::spawn(async move {
                while let Ok((tcp, _)) = feedback_listener.accept().await {
                    let acceptor = acceptor.clone();
                    let feedback = feedback.clone();
                    tokio::spawn(async move {
                        let Ok(mut tls) = acceptor.accept(tcp).await else { return };
                        let mut out = BytesMut::new();
                        for record in feedback.lock().await.iter() {
                            codec::encode_feedback_record(record, &mut out);
                        }
                        let _ = tls.write_all(&out).await;
                        let _ = tls.shutdown().await;
                    });
                }
            });
        }

        Self {
            gateway_port,
            feedback_port,
            frames,
            feedback,
            connections,
        }
    }

    pub async fn set_feedback(&self, records: Vec<FeedbackRecord>) {
        *self.feedback.lock().await = records;
    }

    pub async fn frames(&self) -> Vec<NotificationFrame> {
        self.frames.lock().await.clone()
    }

    /// Completed TLS handshakes on the notification port.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` frames have been recorded, or give up after 5s.
    pub async fn wait_for_frames(&self, n: usize) -> Vec<NotificationFrame> {
        for _ in 0..100 {
            let frames = self.frames().await;
            if frames.len() >= n {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.frames().await
    }
}

/// Config pointing both environments at `backend`, trusting only the test CA.
pub fn config_for(pki: &TestPki, backend: &Backend) -> Config {
    let dir = temp_dir("backend");
    let ca_path = dir.join("ca.pem");
    std::fs::write(&ca_path, pki.ca_pem()).expect("write ca file");

    let endpoints = EnvironmentEndpoints {
        gateway: format!("localhost:{}", backend.gateway_port),
        feedback: format!("localhost:{}", backend.feedback_port),
    };
    let mut config = Config::default();
    config.tls.native_roots = false;
    config.tls.ca_file = Some(ca_path);
    config.push.endpoints.sandbox = endpoints.clone();
    config.push.endpoints.production = endpoints;
    config.push.call_timeout_secs = 10;
    config.push.feedback_timeout_secs = 10;
    config
}

pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pushgate-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}
