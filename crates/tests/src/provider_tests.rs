use nimbus_core::client::discard;
use nimbus_core::{FileType, Token};
use serde_json::json;

use crate::fixtures::drive_client;
use crate::fixtures::mock_transport::{MockResponse, MockTransport};

fn page(names: &[&str], next: Option<&str>) -> serde_json::Value {
    let files: Vec<_> = names
        .iter()
        .map(|n| json!({"id": format!("id-{n}"), "name": n, "mimeType": "text/plain"}))
        .collect();
    match next {
        Some(token) => json!({"files": files, "nextPageToken": token}),
        None => json!({"files": files}),
    }
}

#[tokio::test]
async fn listing_accumulates_pages_in_order() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(200, page(&["a", "b"], Some("p2"))));
    transport.push(MockResponse::Json(200, page(&["c", "d"], Some("p3"))));
    transport.push(MockResponse::Json(200, page(&["e", "f"], None)));

    let client = drive_client(transport.clone(), Token::new("A1", "R1"));
    let root = client.root_directory();
    let items = client.list_directory(&root, discard).result().await.unwrap();

    let names: Vec<_> = items.iter().map(|i| i.filename.as_str()).collect();
    assert_eq!(names, ["a", "b", "c", "d", "e", "f"]);

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    let token_of = |i: usize| {
        requests[i]
            .query
            .iter()
            .find(|(k, _)| k == "pageToken")
            .map(|(_, v)| v.as_str())
    };
    assert_eq!(token_of(0), None);
    assert_eq!(token_of(1), Some("p2"));
    assert_eq!(token_of(2), Some("p3"));
}

#[tokio::test]
async fn listing_terminates_when_a_page_token_repeats() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(200, page(&["a"], Some("loop"))));
    transport.push(MockResponse::Json(200, page(&["b"], Some("loop"))));

    let client = drive_client(transport.clone(), Token::new("A1", "R1"));
    let root = client.root_directory();
    let items = client.list_directory(&root, discard).result().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn drive_metadata_maps_to_items() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(
        200,
        json!({
            "files": [
                {"id": "d1", "name": "docs", "mimeType": "application/vnd.google-apps.folder"},
                {"id": "f1", "name": "song.mp3", "mimeType": "audio/mpeg", "size": "4096",
                 "modifiedTime": "2024-03-01T12:00:00Z"},
            ]
        }),
    ));

    let client = drive_client(transport, Token::new("A1", "R1"));
    let root = client.root_directory();
    let items = client.list_directory(&root, discard).result().await.unwrap();

    assert_eq!(items[0].file_type, FileType::Directory);
    assert_eq!(items[0].size, None);
    assert_eq!(items[1].file_type, FileType::Audio);
    assert_eq!(items[1].size, Some(4096));
    assert!(items[1].timestamp.is_some());
    // Files get a playable daemon URL; directories do not.
    assert!(items[1].url.as_deref().unwrap().contains("/?state="));
    assert!(items[0].url.is_none());
}

#[tokio::test]
async fn general_data_reports_quota() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(
        200,
        json!({
            "user": {"emailAddress": "alice@example.com"},
            "storageQuota": {"usage": "1024", "limit": "2048"},
        }),
    ));

    let client = drive_client(transport, Token::new("A1", "R1"));
    let data = client.general_data(discard).result().await.unwrap();
    assert_eq!(data.username, "alice@example.com");
    assert_eq!(data.space_used, 1024);
    assert_eq!(data.space_total, 2048);
}
