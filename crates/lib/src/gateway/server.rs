//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::error::PushError;
use crate::gateway::protocol::{
    ConnectParams, FeedbackParams, HelloOk, HelloPolicy, NotifyParams, ProvisionParams,
    WsError, WsRequest, WsResponse,
};
use crate::service::PushService;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, push service, event fan-out).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients (e.g. shutdown). Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    pub service: Arc<PushService>,
}

/// Run the gateway until SIGINT/SIGTERM. Apps listed in config are provisioned first;
/// one that fails is logged and skipped.
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or PUSHGATE_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let service = Arc::new(PushService::from_config(&config).context("building push service")?);
    provision_configured_apps(&service, &config).await;

    let required_token = require_connect_token(&config);
    let (event_tx, _) = broadcast::channel(64);
    let port = config.gateway.port;
    let state = GatewayState {
        config: Arc::new(config),
        required_token,
        event_tx: event_tx.clone(),
        service: service.clone(),
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx, service))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

async fn provision_configured_apps(service: &PushService, config: &Config) {
    for app in &config.apps {
        let pem = match resolve_cert(&app.cert).await {
            Ok(pem) => pem,
            Err(e) => {
                log::warn!("skipping configured app {}: {}", app.app_id, e);
                continue;
            }
        };
        if let Err(e) = service
            .provision(&app.app_id, &pem, &app.environment, app.timeout)
            .await
        {
            log::warn!("skipping configured app {}: {}", app.app_id, e);
        }
    }
}

/// `cert` is inline PEM when it contains a PEM boundary, otherwise a path on the gateway host.
async fn resolve_cert(cert: &str) -> std::result::Result<Vec<u8>, PushError> {
    if cert.contains("-----BEGIN") {
        return Ok(cert.as_bytes().to_vec());
    }
    let path = cert.trim();
    if path.is_empty() {
        return Err(PushError::InvalidArgument("cert is empty".to_string()));
    }
    tokio::fs::read(path)
        .await
        .map_err(|e| PushError::InvalidArgument(format!("reading cert {}: {}", path, e)))
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients, then closes every backend session.
async fn shutdown_signal(event_tx: broadcast::Sender<String>, service: Arc<PushService>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and closing sessions");

    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
    service.shutdown().await;
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn to_text(res: &WsResponse) -> String {
    serde_json::to_string(res).unwrap_or_default()
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let mut event_rx = state.event_tx.subscribe();

    // Sole writer to the socket: responses from request tasks and broadcast events.
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                event = event_rx.recv() => {
                    match event {
                        Ok(text) => {
                            let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                            let _ = sink.send(Message::Text(text)).await;
                            if is_shutdown {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("ws client lagged {} broadcast messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                out = out_rx.recv() => {
                    let Some(text) = out else { break };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut connected = false;
    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { break };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(req): std::result::Result<WsRequest, _> = serde_json::from_str(&text) else {
            log::debug!("ignoring malformed ws frame");
            continue;
        };
        if req.typ != "req" {
            continue;
        }

        match req.method.as_str() {
            "connect" => {
                let res = handle_connect(&state, &req);
                connected |= res.ok;
                if out_tx.send(to_text(&res)).await.is_err() {
                    break;
                }
            }
            "health" => {
                let res = WsResponse::ok(
                    &req.id,
                    json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }),
                );
                if out_tx.send(to_text(&res)).await.is_err() {
                    break;
                }
            }
            _ if !connected => {
                let res = WsResponse::err(
                    &req.id,
                    WsError::new("Unauthorized", "first request must be connect"),
                );
                if out_tx.send(to_text(&res)).await.is_err() {
                    break;
                }
            }
            _ => {
                let state = state.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let res = dispatch(&state, req).await;
                    let _ = out_tx.send(to_text(&res)).await;
                });
            }
        }
    }

    if !connected {
        log::debug!("ws client disconnected before sending connect");
    }
    drop(out_tx);
    let _ = writer.await;
}

fn handle_connect(state: &GatewayState, req: &WsRequest) -> WsResponse {
    let params: ConnectParams = if req.params.is_null() {
        ConnectParams::default()
    } else {
        match serde_json::from_value(req.params.clone()) {
            Ok(p) => p,
            Err(e) => {
                return WsResponse::err(
                    &req.id,
                    WsError::new("InvalidArgument", format!("invalid connect params: {}", e)),
                )
            }
        }
    };
    if let Some(ref required) = state.required_token {
        let provided = params.auth.token.as_deref().unwrap_or("").trim();
        if provided.is_empty() {
            return WsResponse::err(
                &req.id,
                WsError::new(
                    "Unauthorized",
                    "gateway token missing (set PUSHGATE_GATEWAY_TOKEN or gateway.auth.token)",
                ),
            );
        }
        if provided != required {
            return WsResponse::err(&req.id, WsError::new("Unauthorized", "gateway token mismatch"));
        }
    }
    if let Some(client) = params.client.id.as_deref() {
        log::debug!("ws client connected: {}", client);
    }
    let protocol = params
        .max_protocol
        .unwrap_or(PROTOCOL_VERSION)
        .min(PROTOCOL_VERSION);
    let push = state.service.config();
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol,
        policy: Some(HelloPolicy {
            max_payload_bytes: push.max_payload_bytes,
            call_timeout_ms: push.call_timeout().as_millis() as u64,
        }),
    };
    WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})))
}

fn parse_params<T: DeserializeOwned>(req: &WsRequest) -> std::result::Result<T, PushError> {
    serde_json::from_value(req.params.clone()).map_err(|e| {
        PushError::InvalidArgument(format!("invalid {} params: {}", req.method, e))
    })
}

async fn dispatch(state: &GatewayState, req: WsRequest) -> WsResponse {
    let result = match req.method.as_str() {
        "status" => Ok(status_payload(state).await),
        "provision" => provision(state, &req).await,
        "notify" => notify(state, &req).await,
        "feedback" => feedback(state, &req).await,
        _ => {
            return WsResponse::err(
                &req.id,
                WsError::new("UnknownMethod", format!("unknown method: {}", req.method)),
            )
        }
    };
    match result {
        Ok(payload) => WsResponse::ok(&req.id, payload),
        Err(e) => {
            log::debug!("{} {} failed: {}", req.method, req.id, e);
            WsResponse::err(&req.id, WsError::from(&e))
        }
    }
}

async fn status_payload(state: &GatewayState) -> serde_json::Value {
    let auth_mode = if state.required_token.is_some() {
        "token"
    } else {
        "none"
    };
    json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "bind": state.config.gateway.bind,
        "auth": auth_mode,
        "apps": state.service.status().await,
    })
}

async fn provision(
    state: &GatewayState,
    req: &WsRequest,
) -> std::result::Result<serde_json::Value, PushError> {
    let params: ProvisionParams = parse_params(req)?;
    let pem = resolve_cert(&params.cert).await?;
    let created = state
        .service
        .provision(&params.app_id, &pem, &params.environment, params.timeout)
        .await?;
    Ok(json!({ "created": created }))
}

async fn notify(
    state: &GatewayState,
    req: &WsRequest,
) -> std::result::Result<serde_json::Value, PushError> {
    let params: NotifyParams = parse_params(req)?;
    let tokens = params.tokens.into_vec();
    let notifications = params.notifications.into_vec();
    let sent = state
        .service
        .notify(&params.app_id, &tokens, &notifications)
        .await?;
    Ok(json!({ "sent": sent }))
}

async fn feedback(
    state: &GatewayState,
    req: &WsRequest,
) -> std::result::Result<serde_json::Value, PushError> {
    let params: FeedbackParams = parse_params(req)?;
    let records = state.service.feedback(&params.app_id).await?;
    let pairs: Vec<serde_json::Value> = records
        .iter()
        .map(|r| json!([r.expired_at().to_rfc3339(), r.token.to_hex()]))
        .collect();
    Ok(serde_json::Value::Array(pairs))
}
