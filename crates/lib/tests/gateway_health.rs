//! Integration test: start the gateway on a free port, GET /, assert health JSON.
//! Needs no backend. The server task is left running when the test ends.

mod common;

use pushgate_core::config::Config;
use pushgate_core::gateway;
use std::time::Duration;

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = common::free_port();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.tls.native_roots = false;

    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let json: serde_json::Value = resp.json().await.expect("parse JSON");
                assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
                assert_eq!(json.get("protocol").and_then(|v| v.as_u64()), Some(1));
                assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
                return;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gateway_handle.abort();
    panic!(
        "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
        url, last_err
    );
}

#[tokio::test]
async fn gateway_refuses_public_bind_without_token() {
    let mut config = Config::default();
    config.gateway.port = common::free_port();
    config.gateway.bind = "0.0.0.0".to_string();
    config.tls.native_roots = false;
    if std::env::var("PUSHGATE_GATEWAY_TOKEN").is_ok() {
        return;
    }
    let err = gateway::run_gateway(config).await.unwrap_err();
    assert!(err.to_string().contains("refusing to bind"), "{}", err);
}
