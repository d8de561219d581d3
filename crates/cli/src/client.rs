//! Minimal WebSocket client for the running gateway: connect, then one request per call.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use pushgate_core::config::Config;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub struct GatewayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl GatewayClient {
    /// Open the socket to the gateway described by `config` and complete `connect`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let bind = config.gateway.bind.trim();
        let host = if bind == "0.0.0.0" || bind == "::" {
            "127.0.0.1"
        } else {
            bind
        };
        let ws_url = format!("ws://{}:{}/ws", host, config.gateway.port);
        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .with_context(|| format!("connecting to gateway at {}", ws_url))?;

        let mut client = Self { ws, next_id: 1 };
        let mut params = serde_json::json!({
            "client": { "id": "pushgate-cli", "version": env!("CARGO_PKG_VERSION") },
        });
        if let Some(token) = pushgate_core::config::resolve_gateway_token(config) {
            params["auth"] = serde_json::json!({ "token": token });
        }
        client
            .request("connect", params)
            .await
            .context("gateway connect")?;
        Ok(client)
    }

    /// Send one request and wait for its response; returns the payload or the error.
    pub async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.to_string();
        self.next_id += 1;
        let req = serde_json::json!({
            "type": "req",
            "id": id,
            "method": method,
            "params": params,
        });
        self.ws.send(Message::Text(req.to_string())).await?;

        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            let res: serde_json::Value = serde_json::from_str(&text)?;
            match res.get("type").and_then(|v| v.as_str()) {
                Some("event") => {
                    if res.get("event").and_then(|v| v.as_str()) == Some("shutdown") {
                        bail!("gateway is shutting down");
                    }
                    continue;
                }
                Some("res") => {}
                _ => continue,
            }
            if res.get("id").and_then(|v| v.as_str()) != Some(id.as_str()) {
                continue;
            }
            if res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                return Ok(res.get("payload").cloned().unwrap_or(serde_json::Value::Null));
            }
            return Err(describe_error(res.get("error")));
        }
        bail!("gateway closed the connection before responding to {}", method)
    }
}

fn describe_error(error: Option<&serde_json::Value>) -> anyhow::Error {
    let Some(error) = error else {
        return anyhow!("request failed");
    };
    let kind = error.get("kind").and_then(|v| v.as_str()).unwrap_or("Error");
    let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
    match error.get("index").and_then(|v| v.as_u64()) {
        Some(i) => anyhow!("{} (notification {}): {}", kind, i, message),
        None => anyhow!("{}: {}", kind, message),
    }
}
