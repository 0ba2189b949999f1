pub mod mock_sdk;
pub mod mock_transport;

use std::sync::Arc;

use nimbus_core::provider::google_drive::GoogleDrive;
use nimbus_core::{CloudClient, CloudProvider, Hints, LibraryContext, Token};
use tempfile::TempDir;

use self::mock_transport::MockTransport;

/// Library context wired to a mock transport and no consent UI. Tests that
/// exercise the upload cache pass their own scratch directory instead.
pub fn test_context(transport: Arc<MockTransport>) -> LibraryContext {
    LibraryContext {
        transport,
        consent: None,
        daemon_url: "http://127.0.0.1:9999".to_string(),
        temporary_directory: std::env::temp_dir(),
    }
}

pub fn oauth_hints() -> Hints {
    let mut hints = Hints::new();
    hints.insert("client_id".to_string(), "test-client".to_string());
    hints.insert("client_secret".to_string(), "test-secret".to_string());
    hints.insert(
        "redirect_uri".to_string(),
        "http://127.0.0.1:9999".to_string(),
    );
    hints
}

/// A Google Drive client over the mock transport, with a preloaded token.
pub fn drive_client(transport: Arc<MockTransport>, token: Token) -> CloudClient {
    let context = test_context(transport);
    let provider: Arc<dyn CloudProvider> =
        Arc::new(GoogleDrive::new(context.clone(), &oauth_hints(), Some(token)));
    CloudClient::new(provider, context)
}

/// A scratch directory for cache-file tests, removed when dropped. Keep
/// the handle alive for as long as the file system uses it.
pub fn scratch_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("nimbus-")
        .tempdir()
        .expect("create scratch dir")
}
