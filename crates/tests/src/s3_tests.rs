use std::sync::Arc;

use nimbus_core::provider::s3::S3;
use nimbus_core::{CloudProvider, Hints, Item, RequestContext, Token};

use crate::fixtures::mock_transport::{MockResponse, MockTransport};
use crate::fixtures::test_context;

fn s3_provider(transport: Arc<MockTransport>) -> S3 {
    let mut hints = Hints::new();
    hints.insert("aws_region".to_string(), "us-east-1".to_string());
    hints.insert(
        "redirect_uri".to_string(),
        "http://127.0.0.1:9999".to_string(),
    );
    S3::new(
        test_context(transport),
        &hints,
        Some(Token::new("AKIA@secret", "AKIA@secret")),
    )
}

#[tokio::test]
async fn bucket_rename_is_refused_without_a_request() {
    let transport = MockTransport::new();
    let s3 = s3_provider(transport.clone());
    let bucket = Item::directory("bucket", "bucket");

    let error = s3
        .rename_item(&RequestContext::default(), &bucket, "new-name")
        .await
        .unwrap_err();
    assert_eq!(error.code, 403);
    assert_eq!(error.description, "buckets cannot be renamed");
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn bucket_move_is_refused() {
    let transport = MockTransport::new();
    let s3 = s3_provider(transport.clone());
    let bucket = Item::directory("bucket", "bucket");
    let other = Item::directory("other", "other");

    let error = s3
        .move_item(&RequestContext::default(), &bucket, &other)
        .await
        .unwrap_err();
    assert_eq!(error.code, 403);
    assert_eq!(error.description, "buckets cannot be moved");
}

#[tokio::test]
async fn exchange_code_splits_credentials() {
    let transport = MockTransport::new();
    let s3 = s3_provider(transport);
    let ctx = RequestContext::default();

    let token = s3.exchange_code(&ctx, "AKIA@secret").await.unwrap();
    assert_eq!(token.access_token, "AKIA@secret");
    assert!(s3.exchange_code(&ctx, "no-separator").await.is_err());
}

#[tokio::test]
async fn root_listing_translates_buckets_to_directories() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Bytes(
        200,
        br#"<?xml version="1.0"?>
<ListAllMyBucketsResult>
  <Owner><DisplayName>alice</DisplayName></Owner>
  <Buckets>
    <Bucket><Name>media</Name></Bucket>
    <Bucket><Name>backups</Name></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#
            .to_vec(),
    ));

    let s3 = s3_provider(transport.clone());
    let root = s3.root_directory();
    let page = s3
        .list_directory_page(&RequestContext::default(), &root, None)
        .await
        .unwrap();

    let names: Vec<_> = page.items.iter().map(|i| i.filename.as_str()).collect();
    assert_eq!(names, ["media", "backups"]);
    assert!(page.items.iter().all(|i| i.is_directory()));
    // The listing request was signed.
    let auth = transport.requests()[0].header("Authorization").unwrap().to_string();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIA/"));
}

#[tokio::test]
async fn object_listing_translates_prefixes_to_folders() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Bytes(
        200,
        br#"<?xml version="1.0"?>
<ListBucketResult>
  <CommonPrefixes><Prefix>photos/</Prefix></CommonPrefixes>
  <Contents>
    <Key>notes.txt</Key>
    <Size>12</Size>
    <LastModified>2024-03-01T12:00:00Z</LastModified>
  </Contents>
</ListBucketResult>"#
            .to_vec(),
    ));

    let s3 = s3_provider(transport.clone());
    let bucket = Item::directory("media", "media");
    let page = s3
        .list_directory_page(&RequestContext::default(), &bucket, None)
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, "media/photos/");
    assert!(page.items[0].is_directory());
    assert_eq!(page.items[1].id, "media/notes.txt");
    assert_eq!(page.items[1].size, Some(12));
    let request = &transport.requests()[0];
    assert!(request.query.contains(&("delimiter".to_string(), "/".to_string())));
}

#[tokio::test]
async fn directory_rename_is_recursive_copy_plus_delete() {
    let transport = MockTransport::new();
    // Listing of everything under the old prefix.
    transport.push(MockResponse::Bytes(
        200,
        br#"<?xml version="1.0"?>
<ListBucketResult>
  <Contents><Key>old/a.txt</Key><Size>1</Size></Contents>
  <Contents><Key>old/sub/b.txt</Key><Size>1</Size></Contents>
</ListBucketResult>"#
            .to_vec(),
    ));
    // copy + delete per object.
    for _ in 0..2 {
        transport.push(MockResponse::Bytes(200, Vec::new()));
        transport.push(MockResponse::Bytes(204, Vec::new()));
    }

    let s3 = s3_provider(transport.clone());
    let directory = Item::directory("media/old/", "old");
    let renamed = s3
        .rename_item(&RequestContext::default(), &directory, "new")
        .await
        .unwrap();
    assert_eq!(renamed.id, "media/new/");

    let requests = transport.requests();
    assert_eq!(requests.len(), 5);
    assert_eq!(requests[1].method, "PUT");
    assert_eq!(
        requests[1].header("x-amz-copy-source"),
        Some("/media/old/a.txt")
    );
    assert!(requests[1].url.ends_with("/new/a.txt"));
    assert_eq!(requests[2].method, "DELETE");
    assert!(requests[3].url.ends_with("/new/sub/b.txt"));
}
