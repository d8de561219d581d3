//! Integration tests: the push service against a local TLS backend.

mod common;

use common::{config_for, Backend, TestPki};
use pushgate_core::codec::{DeviceToken, FeedbackRecord};
use pushgate_core::service::PushService;
use serde_json::json;
use std::sync::Arc;

async fn setup() -> (TestPki, Backend, PushService) {
    let pki = TestPki::new();
    let backend = Backend::start(&pki).await;
    let service = PushService::from_config(&config_for(&pki, &backend)).expect("service");
    (pki, backend, service)
}

#[tokio::test]
async fn notify_delivers_frame_end_to_end() {
    let (pki, backend, service) = setup().await;
    let created = service
        .provision("A", pki.client_pem("A").as_bytes(), "sandbox", Some(15))
        .await
        .unwrap();
    assert!(created);

    let token = "ab".repeat(16);
    let sent = service
        .notify("A", &[token.clone()], &[json!({"aps": {"alert": "hi"}})])
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let frames = backend.wait_for_frames(1).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].token, DeviceToken::from_hex(&token).unwrap());
    assert_eq!(frames[0].expiry, 0);
    let payload: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
    assert_eq!(payload, json!({"aps": {"alert": "hi"}}));
    assert_eq!(service.status().await[0].state, "connected");
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn notify_unknown_app_never_connects() {
    let (_pki, backend, service) = setup().await;
    let err = service
        .notify("ghost", &["ab".repeat(32)], &[json!({"aps": {"alert": "hi"}})])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotProvisioned");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn oversize_payload_leaves_session_untouched() {
    let (pki, backend, service) = setup().await;
    service
        .provision("A", pki.client_pem("A").as_bytes(), "production", None)
        .await
        .unwrap();
    let err = service
        .notify(
            "A",
            &["ab".repeat(32)],
            &[json!({"aps": {"alert": "x".repeat(400)}})],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PayloadTooLarge");
    assert_eq!(err.index(), Some(0));
    assert_eq!(service.status().await[0].state, "unprovisioned");
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn double_provision_keeps_first_environment() {
    let (pki, _backend, service) = setup().await;
    assert!(service
        .provision("A", pki.client_pem("A").as_bytes(), "sandbox", None)
        .await
        .unwrap());
    assert!(!service
        .provision("A", pki.client_pem("A2").as_bytes(), "production", None)
        .await
        .unwrap());
    let status = service.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].environment.as_str(), "sandbox");
}

#[tokio::test]
async fn concurrent_batches_are_contiguous_and_ordered() {
    let (pki, backend, service) = setup().await;
    service
        .provision("A", pki.client_pem("A").as_bytes(), "sandbox", None)
        .await
        .unwrap();
    let service = Arc::new(service);

    let batch = |marker: &str| -> (Vec<String>, Vec<serde_json::Value>) {
        (0..5)
            .map(|i| {
                (
                    "cd".repeat(32),
                    json!({"aps": {"alert": format!("{}-{}", marker, i)}}),
                )
            })
            .unzip()
    };
    let mut handles = Vec::new();
    for marker in ["a", "b", "c"] {
        let svc = service.clone();
        let (tokens, payloads) = batch(marker);
        handles.push(tokio::spawn(async move {
            svc.notify("A", &tokens, &payloads).await
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap().unwrap(), 5);
    }

    let frames = backend.wait_for_frames(15).await;
    assert_eq!(frames.len(), 15);
    let alerts: Vec<String> = frames
        .iter()
        .map(|f| {
            let v: serde_json::Value = serde_json::from_slice(&f.payload).unwrap();
            v["aps"]["alert"].as_str().unwrap().to_string()
        })
        .collect();
    for chunk in alerts.chunks(5) {
        let marker = chunk[0].split('-').next().unwrap().to_string();
        let expected: Vec<String> = (0..5).map(|i| format!("{}-{}", marker, i)).collect();
        assert_eq!(chunk, expected.as_slice(), "batches interleaved: {:?}", alerts);
    }
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn feedback_returns_records() {
    let (pki, backend, service) = setup().await;
    service
        .provision("A", pki.client_pem("A").as_bytes(), "sandbox", None)
        .await
        .unwrap();
    backend
        .set_feedback(vec![
            FeedbackRecord {
                timestamp: 1_700_000_000,
                token: DeviceToken::from_bytes(vec![0xab; 32]),
            },
            FeedbackRecord {
                timestamp: 1_700_000_100,
                token: DeviceToken::from_bytes(vec![0xcd; 32]),
            },
        ])
        .await;

    let records = service.feedback("A").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].token.to_hex(), "ab".repeat(32));
    assert_eq!(
        records[1].expired_at().to_rfc3339(),
        "2023-11-14T22:15:00+00:00"
    );
}

#[tokio::test]
async fn feedback_with_no_records_is_empty() {
    let (pki, _backend, service) = setup().await;
    service
        .provision("A", pki.client_pem("A").as_bytes(), "sandbox", None)
        .await
        .unwrap();
    let records = service.feedback("A").await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn untrusted_backend_fails_connect() {
    let (pki, backend, _) = setup().await;
    let other = TestPki::new();
    // Trust a different CA than the one that signed the backend's certificate.
    let mut config = config_for(&other, &backend);
    config.push.call_timeout_secs = 5;
    let service = PushService::from_config(&config).unwrap();
    service
        .provision("A", pki.client_pem("A").as_bytes(), "sandbox", Some(5))
        .await
        .unwrap();
    let err = service
        .notify("A", &["ab".repeat(32)], &[json!({"aps": {"badge": 1}})])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ConnectFailed");
    assert_eq!(err.index(), Some(0));
    assert_eq!(service.status().await[0].state, "failed");
}
