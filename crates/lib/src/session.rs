//! Connection session: the one notification socket an application shares among callers.
//!
//! State lives behind a single lock and every transition happens inside it. A connect
//! attempt runs as its own task and publishes its outcome on a watch channel, so any number
//! of callers can wait on the same attempt and a caller giving up does not cancel it.
//! Writes go through a separate FIFO lock (`write_path`) so one notify batch owns the
//! socket for all of its frames.

use crate::codec::{self, FeedbackDecoder, FeedbackRecord};
use crate::credentials::{AppCredential, Environment};
use crate::error::{PushError, Result};
use crate::tls::{BoxStream, Connector, Service};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Health of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected.
    Unprovisioned,
    Connecting,
    Connected,
    Failed(String),
    Closed,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unprovisioned => "unprovisioned",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed(_) => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// `None` until the attempt resolves.
type Outcome = Option<Result<()>>;

type Writer = Arc<Mutex<WriteHalf<BoxStream>>>;

struct Inner {
    state: SessionState,
    attempt: Option<watch::Receiver<Outcome>>,
    writer: Option<Writer>,
    reader: Option<JoinHandle<()>>,
    /// Bumped per connect attempt and on close; stale tasks compare against it.
    generation: u64,
}

impl Inner {
    fn drop_connection(&mut self) {
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

pub struct Session {
    credential: Arc<AppCredential>,
    connector: Arc<dyn Connector>,
    inner: Arc<Mutex<Inner>>,
    write_path: Mutex<()>,
    sequence: AtomicU32,
}

impl Session {
    pub fn new(credential: Arc<AppCredential>, connector: Arc<dyn Connector>) -> Self {
        Self {
            credential,
            connector,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Unprovisioned,
                attempt: None,
                writer: None,
                reader: None,
                generation: 0,
            })),
            write_path: Mutex::new(()),
            sequence: AtomicU32::new(1),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.credential.app_id
    }

    pub fn environment(&self) -> Environment {
        self.credential.environment
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    /// Sequence id for the next frame. Only used to correlate backend error responses.
    pub fn next_sequence_id(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure the notification socket is up, waiting at most `timeout` for it.
    ///
    /// Joins an attempt already in flight instead of starting a second handshake. If the
    /// wait times out the attempt keeps running and settles the session state on its own.
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Connected {
                return Ok(());
            }
            let in_flight = match (&inner.state, &inner.attempt) {
                (SessionState::Connecting, Some(rx)) => Some(rx.clone()),
                _ => None,
            };
            match in_flight {
                Some(rx) => rx,
                None => self.start_attempt(&mut inner),
            }
        };
        match tokio::time::timeout(timeout, wait_for_outcome(rx)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PushError::ConnectTimeout {
                endpoint: self.connector.endpoint(&self.credential, Service::Gateway),
                timeout,
            }),
        }
    }

    fn start_attempt(&self, inner: &mut Inner) -> watch::Receiver<Outcome> {
        let (tx, rx) = watch::channel(None);
        inner.generation += 1;
        inner.state = SessionState::Connecting;
        inner.attempt = Some(rx.clone());
        inner.drop_connection();

        let generation = inner.generation;
        let credential = self.credential.clone();
        let connector = self.connector.clone();
        let shared = self.inner.clone();
        log::debug!("app {}: starting connect attempt {}", credential.app_id, generation);
        tokio::spawn(async move {
            let result = connect_with_timeout(connector.as_ref(), &credential, Service::Gateway).await;
            let outcome = {
                let mut inner = shared.lock().await;
                if inner.generation != generation {
                    Err(PushError::ConnectFailed {
                        endpoint: connector.endpoint(&credential, Service::Gateway),
                        reason: "session closed while connecting".to_string(),
                    })
                } else {
                    inner.attempt = None;
                    match result {
                        Ok(stream) => {
                            let (read, write) = tokio::io::split(stream);
                            inner.writer = Some(Arc::new(Mutex::new(write)));
                            inner.reader = Some(tokio::spawn(watch_backend(
                                shared.clone(),
                                generation,
                                read,
                                credential.app_id.clone(),
                            )));
                            inner.state = SessionState::Connected;
                            log::info!(
                                "app {}: connected to {}",
                                credential.app_id,
                                connector.endpoint(&credential, Service::Gateway)
                            );
                            Ok(())
                        }
                        Err(e) => {
                            log::warn!("app {}: {}", credential.app_id, e);
                            inner.state = SessionState::Failed(e.to_string());
                            Err(e)
                        }
                    }
                }
            };
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    /// Acquire the single-writer path. Waiters are served in arrival order.
    pub async fn write_path(&self, timeout: Duration) -> Result<WritePath<'_>> {
        let guard = tokio::time::timeout(timeout, self.write_path.lock())
            .await
            .map_err(|_| PushError::Timeout {
                operation: "waiting for the session write path",
                timeout,
            })?;
        Ok(WritePath {
            session: self,
            _guard: guard,
        })
    }

    /// Write one frame. Requires Connected; an I/O error fails the session and is returned
    /// as is, the frame is not retried. A write still pending after `timeout` (backend not
    /// reading) also fails the session, since the frame may be partially written.
    pub async fn send_frame(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        let (writer, generation) = {
            let inner = self.inner.lock().await;
            match (&inner.state, &inner.writer) {
                (SessionState::Connected, Some(writer)) => (writer.clone(), inner.generation),
                (state, _) => {
                    return Err(PushError::SendFailed(format!("session is {}", state)));
                }
            }
        };
        let write = async {
            let mut w = writer.lock().await;
            w.write_all(frame).await?;
            w.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let reason = format!("write failed: {}", e);
                log::warn!("app {}: {}", self.app_id(), reason);
                mark_failed(&self.inner, generation, reason).await;
                Err(PushError::SendFailed(e.to_string()))
            }
            Err(_) => {
                let reason = format!("write stalled for {:?}", timeout);
                log::warn!("app {}: {}", self.app_id(), reason);
                mark_failed(&self.inner, generation, reason).await;
                Err(PushError::Timeout {
                    operation: "writing a frame",
                    timeout,
                })
            }
        }
    }

    /// Open a one-shot connection to the feedback service and read it until the backend
    /// closes it. The whole read is bounded by `timeout`.
    pub async fn pull_feedback(&self, timeout: Duration) -> Result<Vec<FeedbackRecord>> {
        let mut stream =
            connect_with_timeout(self.connector.as_ref(), &self.credential, Service::Feedback).await?;
        let app_id = self.app_id().to_string();
        let read_all = async move {
            let mut decoder = FeedbackDecoder::new();
            let mut records = Vec::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                    Err(e) => return Err(PushError::FeedbackReadFailed(e.to_string())),
                };
                if n == 0 {
                    break;
                }
                records.extend(decoder.push(&buf[..n]));
            }
            if !decoder.pending().is_empty() {
                log::warn!(
                    "app {}: feedback stream ended with {} byte(s) of a partial record",
                    app_id,
                    decoder.pending().len()
                );
            }
            Ok(records)
        };
        let records = tokio::time::timeout(timeout, read_all)
            .await
            .map_err(|_| PushError::Timeout {
                operation: "reading feedback",
                timeout,
            })??;
        log::info!("app {}: feedback returned {} record(s)", self.app_id(), records.len());
        Ok(records)
    }

    /// Drop the socket and stop accepting work until the next `ensure_connected`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.attempt = None;
        inner.drop_connection();
        inner.state = SessionState::Closed;
    }
}

/// Exclusive hold on a session's write path; frames sent through it are contiguous.
pub struct WritePath<'a> {
    session: &'a Session,
    _guard: MutexGuard<'a, ()>,
}

impl WritePath<'_> {
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        self.session.ensure_connected(timeout).await
    }

    pub async fn send_frame(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        self.session.send_frame(frame, timeout).await
    }
}

async fn wait_for_outcome(mut rx: watch::Receiver<Outcome>) -> Result<()> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(PushError::ConnectFailed {
                endpoint: String::new(),
                reason: "connect attempt was dropped".to_string(),
            });
        }
    }
}

async fn connect_with_timeout(
    connector: &dyn Connector,
    credential: &AppCredential,
    service: Service,
) -> Result<BoxStream> {
    let timeout = credential.connect_timeout;
    match tokio::time::timeout(timeout, connector.connect(credential, service)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(PushError::ConnectFailed {
            endpoint: connector.endpoint(credential, service),
            reason: e.to_string(),
        }),
        Err(_) => Err(PushError::ConnectTimeout {
            endpoint: connector.endpoint(credential, service),
            timeout,
        }),
    }
}

async fn mark_failed(inner: &Mutex<Inner>, generation: u64, reason: String) {
    let mut inner = inner.lock().await;
    if inner.generation != generation || inner.state != SessionState::Connected {
        return;
    }
    inner.drop_connection();
    inner.state = SessionState::Failed(reason);
}

/// The backend only ever writes on this socket to reject a frame, right before closing.
async fn watch_backend(
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    mut read: ReadHalf<BoxStream>,
    app_id: String,
) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 64];
    let reason = loop {
        match read.read(&mut buf).await {
            Ok(0) => break "connection closed by backend".to_string(),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                if let Some(resp) = codec::decode_error_response(&pending) {
                    log::warn!(
                        "app {}: backend rejected notification {}: {} (status {})",
                        app_id,
                        resp.sequence_id,
                        resp.description(),
                        resp.status
                    );
                    break format!(
                        "backend rejected notification {}: {}",
                        resp.sequence_id,
                        resp.description()
                    );
                }
                if pending.len() >= 6 {
                    log::debug!("app {}: discarding {} unexpected byte(s)", app_id, pending.len());
                    pending.clear();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "connection closed by backend".to_string()
            }
            Err(e) => break format!("read failed: {}", e),
        }
    };
    log::info!("app {}: {}", app_id, reason);
    mark_failed(&inner, generation, reason).await;
}
