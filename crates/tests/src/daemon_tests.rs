use std::collections::HashMap;
use std::sync::Arc;

use nimbus_core::provider::credentials_to_string;
use nimbus_core::Token;
use nimbus_daemon::{build_router, DaemonState, PendingConsents};
use serde_json::json;

use crate::fixtures::drive_client;
use crate::fixtures::mock_transport::{MockResponse, MockTransport};

async fn spawn_daemon(state: DaemonState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test daemon");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn empty_state() -> (DaemonState, Arc<PendingConsents>) {
    let consents = Arc::new(PendingConsents::new());
    (
        DaemonState {
            providers: Arc::new(HashMap::new()),
            consents: consents.clone(),
        },
        consents,
    )
}

#[tokio::test]
async fn mismatched_state_is_rejected_and_pending_attempt_survives() {
    let (state, consents) = empty_state();
    let base = spawn_daemon(state).await;
    let mut rx = consents.register("good-nonce", None);

    let resp = reqwest::get(format!("{base}/?state=wrong&code=abc"))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    // The pending authorize attempt is untouched.
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::oneshot::error::TryRecvError::Empty)
    ));

    let resp = reqwest::get(format!("{base}/?state=good-nonce&code=abc"))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(rx.await.unwrap(), "abc");
}

#[tokio::test]
async fn duplicate_state_is_rejected() {
    let (state, consents) = empty_state();
    let base = spawn_daemon(state).await;
    let _rx = consents.register("nonce", None);

    let first = reqwest::get(format!("{base}/?state=nonce&code=one"))
        .await
        .unwrap();
    assert_eq!(first.status().as_u16(), 200);
    let second = reqwest::get(format!("{base}/?state=nonce&code=two"))
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 400);
}

fn streaming_state(transport: Arc<MockTransport>) -> DaemonState {
    let client = drive_client(transport, Token::new("A1", "R1"));
    let mut providers = HashMap::new();
    providers.insert("google_drive".to_string(), client);
    DaemonState {
        providers: Arc::new(providers),
        consents: Arc::new(PendingConsents::new()),
    }
}

fn opaque_id(item_id: &str) -> String {
    credentials_to_string(&json!({"p": "google_drive", "id": item_id}))
}

#[tokio::test]
async fn ranged_stream_returns_partial_content() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Bytes(206, b"0123".to_vec()));
    let base = spawn_daemon(streaming_state(transport.clone())).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!(
            "{base}/?state=google_drive&id={}&size=10",
            urlencoded(&opaque_id("f1"))
        ))
        .header("Range", "bytes=0-3")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 206);
    assert_eq!(
        resp.headers().get("content-range").unwrap(),
        "bytes 0-3/10"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"0123");

    // The provider received the translated byte range.
    let download = transport.requests().pop().unwrap();
    assert_eq!(download.header("Range"), Some("bytes=0-3"));
}

#[tokio::test]
async fn full_stream_returns_200() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Bytes(200, b"0123456789".to_vec()));
    let base = spawn_daemon(streaming_state(transport)).await;

    let resp = reqwest::get(format!(
        "{base}/?state=google_drive&id={}&size=10",
        urlencoded(&opaque_id("f1"))
    ))
    .await
    .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(resp.bytes().await.unwrap().len(), 10);
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let transport = MockTransport::new();
    let base = spawn_daemon(streaming_state(transport.clone())).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!(
            "{base}/?state=google_drive&id={}&size=10",
            urlencoded(&opaque_id("f1"))
        ))
        .header("Range", "bytes=20-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 416);
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn unknown_provider_is_404() {
    let (state, _consents) = empty_state();
    let base = spawn_daemon(state).await;
    let resp = reqwest::get(format!(
        "{base}/?state=x&id={}&size=1",
        urlencoded(&credentials_to_string(&json!({"p": "nope", "id": "f"})))
    ))
    .await
    .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

fn urlencoded(input: &str) -> String {
    input
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
