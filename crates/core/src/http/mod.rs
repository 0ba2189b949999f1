//! The HTTP transport capability.
//!
//! Providers never talk to the network directly; they build [`HttpRequest`]
//! values and hand them to an [`HttpTransport`]. The transport streams both
//! bodies and reports progress through a [`TransferObserver`], which is also
//! the cancellation and backpressure hook. A network-level failure surfaces
//! as `Err`; an HTTP-level failure surfaces as `Ok` with a non-2xx code so
//! the caller can distinguish the two.

mod transport;

pub use transport::ReqwestTransport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

/// A transport-agnostic request description.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub follow_redirects: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            follow_redirects: true,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

/// Response metadata. The body has already been streamed into the caller's
/// sink by the time this value is returned.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub code: u16,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Observer wired through every transfer. `abort` returning true makes the
/// transport terminate within one chunk; `paused` stalls body I/O until it
/// flips back. Progress totals of 0 mean "unknown".
pub trait TransferObserver: Send + Sync {
    fn abort(&self) -> bool {
        false
    }
    fn paused(&self) -> bool {
        false
    }
    fn progress_download(&self, _total: u64, _now: u64) {}
    fn progress_upload(&self, _total: u64, _now: u64) {}
}

/// Observer that never aborts and ignores progress.
pub struct NullObserver;

impl TransferObserver for NullObserver {}

/// Random-access reader backing an upload body. Random access (rather than
/// a forward-only stream) lets retries restart without buffering the whole
/// payload and lets SDK shims serve `read(offset, size)` callbacks.
#[async_trait]
pub trait UploadSource: Send + Sync {
    /// Total size, when known ahead of time.
    fn size(&self) -> Option<u64>;

    /// Read up to `len` bytes starting at `offset`. An empty result means
    /// end of input.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// An in-memory upload source.
pub struct BytesSource(pub Bytes);

#[async_trait]
impl UploadSource for BytesSource {
    fn size(&self) -> Option<u64> {
        Some(self.0.len() as u64)
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = (offset as usize).min(self.0.len());
        let end = (start + len).min(self.0.len());
        Ok(self.0.slice(start..end))
    }
}

/// Concatenation of a fixed prefix, an inner source, and a fixed suffix.
/// Multipart and enveloped uploads wrap their payload with this so the
/// content itself still streams.
pub struct CompositeSource {
    prefix: Bytes,
    inner: Arc<dyn UploadSource>,
    suffix: Bytes,
}

impl CompositeSource {
    pub fn new(prefix: Bytes, inner: Arc<dyn UploadSource>, suffix: Bytes) -> Self {
        Self {
            prefix,
            inner,
            suffix,
        }
    }
}

#[async_trait]
impl UploadSource for CompositeSource {
    fn size(&self) -> Option<u64> {
        self.inner
            .size()
            .map(|s| s + self.prefix.len() as u64 + self.suffix.len() as u64)
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let prefix_len = self.prefix.len() as u64;
        if offset < prefix_len {
            let start = offset as usize;
            let end = (start + len).min(self.prefix.len());
            return Ok(self.prefix.slice(start..end));
        }
        let inner_offset = offset - prefix_len;
        let chunk = self.inner.read_at(inner_offset, len).await?;
        if !chunk.is_empty() {
            return Ok(chunk);
        }
        // Inner exhausted; serve the suffix. Requires the inner size to be
        // knowable once drained, which `read_at` past EOF gives us for free:
        // the suffix offset is relative to wherever the inner ended.
        let inner_size = match self.inner.size() {
            Some(size) => size,
            None => inner_offset,
        };
        let suffix_offset = (inner_offset - inner_size) as usize;
        if suffix_offset >= self.suffix.len() {
            return Ok(Bytes::new());
        }
        let end = (suffix_offset + len).min(self.suffix.len());
        Ok(self.suffix.slice(suffix_offset..end))
    }
}

/// Request body variants.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Source(Arc<dyn UploadSource>),
}

impl Body {
    pub fn text(s: impl Into<String>) -> Self {
        Body::Bytes(Bytes::from(s.into()))
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Body::Bytes(Bytes::from(value.to_string()))
    }

    pub fn form(pairs: &[(&str, &str)]) -> Self {
        let encoded = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Body::Bytes(Bytes::from(encoded))
    }
}

/// Destination for response bodies. Implementations decide whether bytes are
/// buffered, written to disk, or forwarded to a consumer channel.
#[async_trait]
pub trait DownloadSink: Send {
    /// Called once with the response metadata before the first body byte;
    /// routing sinks use it to separate success bodies from error bodies
    /// and to record range support for resume.
    fn begin(&mut self, _response: &HttpResponse) {}

    async fn write(&mut self, chunk: &[u8]) -> Result<()>;
}

/// Buffers the body in memory; used for JSON/XML API responses.
#[derive(Default)]
pub struct VecSink(pub Vec<u8>);

#[async_trait]
impl DownloadSink for VecSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.0.extend_from_slice(chunk);
        Ok(())
    }
}

/// Discards the body. Used when only the status matters.
pub struct NullSink;

#[async_trait]
impl DownloadSink for NullSink {
    async fn write(&mut self, _chunk: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Writes chunks into an async file.
pub struct FileSink(pub tokio::fs::File);

#[async_trait]
impl DownloadSink for FileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.0.write_all(chunk).await?;
        Ok(())
    }
}

/// Forwards chunks into an mpsc channel; the daemon uses this to bridge a
/// provider download into an HTTP response body.
pub struct ChannelSink(pub tokio::sync::mpsc::Sender<Bytes>);

#[async_trait]
impl DownloadSink for ChannelSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.0
            .send(Bytes::copy_from_slice(chunk))
            .await
            .map_err(|_| crate::error::Error::aborted())
    }
}

/// The transport capability. Implementations must stream both directions,
/// check `observer.abort()`/`observer.paused()` at chunk granularity, and
/// keep network failures (`Err`) distinct from HTTP failures (`Ok` with a
/// non-2xx code). The observer is shared because upload body streams can
/// outlive the call frame inside the transport.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: HttpRequest,
        body: Body,
        sink: &mut dyn DownloadSink,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<HttpResponse>;
}
