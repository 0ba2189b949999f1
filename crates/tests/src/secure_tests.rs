use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::client::discard;
use nimbus_core::provider::secure::Secure;
use nimbus_core::provider::{credentials_from_string, credentials_to_string};
use nimbus_core::{CloudClient, CloudProvider, Hints, FULL_RANGE};
use serde_json::json;

use crate::fixtures::mock_sdk::MockSdk;
use crate::fixtures::mock_transport::{MockResponse, MockTransport};
use crate::fixtures::test_context;

fn secure_client(transport: Arc<MockTransport>, sdk: MockSdk) -> CloudClient {
    let context = test_context(transport);
    let mut hints = Hints::new();
    hints.insert(
        "redirect_uri".to_string(),
        "http://127.0.0.1:9999".to_string(),
    );
    let provider: Arc<dyn CloudProvider> =
        Arc::new(Secure::new(context.clone(), &hints, None, Box::new(sdk)));
    CloudClient::new(provider, context)
}

fn login_code(username: &str, password: &str) -> String {
    credentials_to_string(&json!({"username": username, "password": password}))
}

#[tokio::test(flavor = "multi_thread")]
async fn exchange_code_derives_the_password_key() {
    let transport = MockTransport::new();
    let client = secure_client(transport, MockSdk::new(&[("alice", "pw")]));

    let token = client
        .exchange_code(&login_code("alice", "pw"), discard)
        .result()
        .await
        .unwrap();

    let blob = credentials_from_string(&token.access_token).unwrap();
    assert_eq!(blob["username"], "alice");
    // The plaintext password is never stored.
    assert!(blob.get("password").is_none());
    assert!(blob["password_key"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn login_fetch_and_list_via_the_transport_shim() {
    let transport = MockTransport::new();
    // The SDK's login round trip goes through the engine transport.
    transport.push(MockResponse::Json(200, json!({"ok": true})));

    let sdk = MockSdk::new(&[("alice", "pw")]).with_file("song.mp3", b"0123456789");
    let client = secure_client(transport.clone(), sdk);

    client
        .exchange_code(&login_code("alice", "pw"), discard)
        .result()
        .await
        .unwrap();

    let root = client.root_directory();
    let items = client.list_directory(&root, discard).result().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].filename, "song.mp3");
    assert_eq!(items[0].size, Some(10));

    // The login actually hit the wire.
    assert_eq!(transport.request_count(), 1);
    assert!(transport.requests()[0].url.contains("mock.sdk/login"));

    // The session blob was re-serialized into the token store.
    let token = client.provider().auth().token().await.unwrap();
    let blob = credentials_from_string(&token.access_token).unwrap();
    assert!(blob["session"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn ranged_read_streams_from_the_sdk() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(200, json!({"ok": true})));

    let sdk = MockSdk::new(&[("alice", "pw")]).with_file("data.bin", b"0123456789");
    let client = secure_client(transport, sdk);
    client
        .exchange_code(&login_code("alice", "pw"), discard)
        .result()
        .await
        .unwrap();

    let root = client.root_directory();
    let items = client.list_directory(&root, discard).result().await.unwrap();

    let bytes = client
        .download_bytes(&items[0], nimbus_core::Range::new(7, 100), discard)
        .result()
        .await
        .unwrap();
    assert_eq!(bytes, b"789");

    let all = client
        .download_bytes(&items[0], FULL_RANGE, discard)
        .result()
        .await
        .unwrap();
    assert_eq!(all, b"0123456789");
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_reads_through_the_file_shim() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(200, json!({"ok": true})));

    let sdk = MockSdk::new(&[("alice", "pw")]);
    let client = secure_client(transport, sdk);
    client
        .exchange_code(&login_code("alice", "pw"), discard)
        .result()
        .await
        .unwrap();

    let root = client.root_directory();
    let source = Arc::new(nimbus_core::http::BytesSource(bytes::Bytes::from_static(
        b"uploaded-content",
    )));
    let item = client
        .upload_file(&root, "new.txt", source, None, discard)
        .result()
        .await
        .unwrap();
    assert_eq!(item.filename, "new.txt");
    assert_eq!(item.size, Some(16));
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_credentials_fail_with_unauthorized() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(200, json!({"ok": true})));

    let sdk = MockSdk::new(&[("alice", "pw")]);
    let client = secure_client(transport, sdk);
    client
        .exchange_code(&login_code("alice", "wrong"), discard)
        .result()
        .await
        .unwrap();

    let root = client.root_directory();
    let error = client
        .list_directory(&root, discard)
        .result()
        .await
        .unwrap_err();
    assert_eq!(error.code, 401);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_before_authorized_logs_the_session_out() {
    let transport = MockTransport::new();
    // The login round trip never completes.
    transport.push(MockResponse::Hang);

    let sdk = MockSdk::new(&[("alice", "pw")]);
    let logouts = sdk.logouts.clone();
    let client = secure_client(transport, sdk);
    client
        .exchange_code(&login_code("alice", "pw"), discard)
        .result()
        .await
        .unwrap();

    let request = client.get_item_data("root", discard);
    tokio::time::sleep(Duration::from_millis(50)).await;
    request.cancel();
    assert!(request.result().await.unwrap_err().is_aborted());

    // The adapter must always log out when cancelled pre-authorization.
    for _ in 0..100 {
        if logouts.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(logouts.load(Ordering::SeqCst), 1);
}
