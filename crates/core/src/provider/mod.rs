//! The provider capability: the uniform operation set every back-end
//! implements, plus the value types shared across them.

pub mod dropbox;
pub mod google_drive;
mod http_core;
pub mod s3;
pub mod secure;

pub use http_core::{BearerAuth, HttpCore, ProviderAuth};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthContext, ConsentUi, Hints, Token};
use crate::error::{Error, Result};
use crate::http::{DownloadSink, HttpTransport, UploadSource};
use crate::request::RequestContext;

/// Classification of an item, derived from provider metadata or the
/// filename extension when the provider has no notion of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Directory,
    Audio,
    Video,
    Image,
    Document,
    Unknown,
}

impl FileType {
    pub fn from_filename(name: &str) -> Self {
        let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("mp3" | "flac" | "ogg" | "wav" | "m4a" | "aac") => FileType::Audio,
            Some("mp4" | "mkv" | "avi" | "webm" | "mov" | "ts") => FileType::Video,
            Some("jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp") => FileType::Image,
            Some("pdf" | "doc" | "docx" | "odt" | "txt" | "md") => FileType::Document,
            _ => FileType::Unknown,
        }
    }
}

/// The uniform file/folder record. Items are value objects; identity is
/// `(provider label, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    /// `None` for streams and other unknown sizes.
    pub size: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Pre-signed or daemon URL for direct consumption, when available.
    pub url: Option<String>,
}

impl Item {
    pub fn new(id: impl Into<String>, filename: impl Into<String>, file_type: FileType) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            file_type,
            size: None,
            timestamp: None,
            url: None,
        }
    }

    pub fn directory(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::new(id, filename, FileType::Directory)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A byte range; `size == None` means "from start to end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub size: Option<u64>,
}

pub const FULL_RANGE: Range = Range {
    start: 0,
    size: None,
};

impl Range {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size: Some(size),
        }
    }

    /// Clamps against the item size; a request entirely past EOF becomes a
    /// zero-byte range.
    pub fn clamp_to(&self, item_size: u64) -> Range {
        let start = self.start.min(item_size);
        let available = item_size - start;
        Range {
            start,
            size: Some(self.size.map_or(available, |s| s.min(available))),
        }
    }

    /// `Range` header value, e.g. `bytes=7-9` or `bytes=7-`.
    pub fn header_value(&self) -> String {
        match self.size {
            Some(0) => format!("bytes={}-{}", self.start, self.start),
            Some(size) => format!("bytes={}-{}", self.start, self.start + size - 1),
            None => format!("bytes={}-", self.start),
        }
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.size.is_none()
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next_page_token: Option<String>,
}

/// Account-level data surfaced in browsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralData {
    pub username: String,
    pub space_used: u64,
    pub space_total: u64,
}

/// Injected context replacing process-wide singletons: the transport, the
/// consent front-end, the local daemon base URL, and the temp directory.
#[derive(Clone)]
pub struct LibraryContext {
    pub transport: Arc<dyn HttpTransport>,
    pub consent: Option<Arc<dyn ConsentUi>>,
    pub daemon_url: String,
    pub temporary_directory: PathBuf,
}

impl LibraryContext {
    /// Builds the local-daemon streaming URL for `item`, so media players
    /// without cloud plugins can range-read through the daemon.
    pub fn file_daemon_url(&self, provider: &str, item: &Item, size: u64) -> String {
        let opaque = credentials_to_string(&serde_json::json!({
            "p": provider,
            "id": item.id,
        }));
        format!(
            "{}/?state={}&id={}&size={}",
            self.daemon_url,
            urlencoding::encode(provider),
            urlencoding::encode(&opaque),
            size
        )
    }
}

/// Opaque bidirectional JSON/base64 envelope used for credential blobs and
/// daemon item references.
pub fn credentials_to_string(value: &serde_json::Value) -> String {
    BASE64.encode(value.to_string())
}

pub fn credentials_from_string(input: &str) -> Result<serde_json::Value> {
    let json = match BASE64.decode(input.trim()) {
        Ok(bytes) => {
            String::from_utf8(bytes).map_err(|_| Error::failure("credentials are not UTF-8"))?
        }
        Err(_) => input.trim().to_string(),
    };
    serde_json::from_str(&json).map_err(|_| Error::failure("malformed credentials"))
}

/// The operation set every back-end implements. Operations take a
/// [`RequestContext`] so cancellation and progress flow through to the
/// transport; the request engine wraps them into `Request<T>` handles.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// The hints this provider honors, with their current values.
    fn hints(&self) -> Hints;

    fn auth(&self) -> &AuthContext;

    fn root_directory(&self) -> Item;

    /// The URL the consent UI opens for this provider, embedding the
    /// per-attempt state nonce.
    fn authorize_library_url(&self, state: &str) -> String;

    async fn exchange_code(&self, ctx: &RequestContext, code: &str) -> Result<Token>;

    /// Cheap authorized probe; used to decide whether a persisted token is
    /// still alive before the first real operation.
    async fn validate_token(&self, _ctx: &RequestContext) -> Result<bool> {
        Ok(true)
    }

    async fn get_item_data(&self, ctx: &RequestContext, id: &str) -> Result<Item>;

    async fn list_directory_page(
        &self,
        ctx: &RequestContext,
        item: &Item,
        page_token: Option<&str>,
    ) -> Result<Page>;

    async fn get_item_url(&self, ctx: &RequestContext, item: &Item) -> Result<String>;

    async fn get_thumbnail(
        &self,
        _ctx: &RequestContext,
        _item: &Item,
        _sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        Err(Error::not_supported("thumbnail"))
    }

    async fn create_directory(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        name: &str,
    ) -> Result<Item>;

    async fn move_item(
        &self,
        ctx: &RequestContext,
        source: &Item,
        destination: &Item,
    ) -> Result<Item>;

    async fn rename_item(&self, ctx: &RequestContext, item: &Item, name: &str) -> Result<Item>;

    async fn delete_item(&self, ctx: &RequestContext, item: &Item) -> Result<()>;

    async fn upload_file(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        filename: &str,
        content: Arc<dyn UploadSource>,
    ) -> Result<Item>;

    async fn download_file(
        &self,
        ctx: &RequestContext,
        item: &Item,
        range: Range,
        sink: &mut dyn DownloadSink,
    ) -> Result<()>;

    async fn general_data(&self, ctx: &RequestContext) -> Result<GeneralData>;
}
