//! Scripted HTTP transport: tests queue responses, the transport records
//! every outbound request (including resolved headers and bodies) so
//! assertions can inspect exactly what a provider sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::http::{
    Body, DownloadSink, HttpRequest, HttpResponse, HttpTransport, TransferObserver,
};
use nimbus_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub enum MockResponse {
    /// JSON body with the given status.
    Json(u16, serde_json::Value),
    /// Raw body with the given status.
    Bytes(u16, Vec<u8>),
    /// Raw body plus extra response headers.
    WithHeaders(u16, Vec<(String, String)>, Vec<u8>),
    /// Network-level failure.
    NetworkError,
    /// Never completes until the observer aborts.
    Hang,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<MockResponse>,
    requests: Vec<RecordedRequest>,
}

#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: MockResponse) {
        self.inner.lock().unwrap().script.push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }
}

async fn drain_body(body: &Body) -> Vec<u8> {
    match body {
        Body::Empty => Vec::new(),
        Body::Bytes(bytes) => bytes.to_vec(),
        Body::Source(source) => {
            let mut out = Vec::new();
            let mut offset = 0u64;
            loop {
                let chunk = source
                    .read_at(offset, 16 * 1024)
                    .await
                    .expect("mock body read");
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as u64;
                out.extend_from_slice(&chunk);
            }
            out
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        body: Body,
        sink: &mut dyn DownloadSink,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<HttpResponse> {
        let recorded = RecordedRequest {
            method: request.method.as_str().to_string(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            query: request.query.clone(),
            body: drain_body(&body).await,
        };
        let scripted = {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(recorded);
            inner.script.pop_front()
        };

        let (code, headers, payload) = match scripted {
            None => panic!("mock transport script exhausted for {}", request.url),
            Some(MockResponse::Json(code, value)) => (
                code,
                vec![("content-type".to_string(), "application/json".to_string())],
                value.to_string().into_bytes(),
            ),
            Some(MockResponse::Bytes(code, bytes)) => (code, Vec::new(), bytes),
            Some(MockResponse::WithHeaders(code, headers, bytes)) => (code, headers, bytes),
            Some(MockResponse::NetworkError) => {
                return Err(Error::transport("mock connection reset"))
            }
            Some(MockResponse::Hang) => loop {
                if observer.abort() {
                    return Err(Error::aborted());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
        };

        let response = HttpResponse {
            code,
            headers: headers.into_iter().collect::<HashMap<_, _>>(),
        };
        sink.begin(&response);
        // Deliver in two chunks to exercise streaming paths.
        let total = payload.len() as u64;
        let mid = payload.len() / 2;
        let mut delivered = 0u64;
        for chunk in [&payload[..mid], &payload[mid..]] {
            if chunk.is_empty() {
                continue;
            }
            if observer.abort() {
                return Err(Error::aborted());
            }
            sink.write(chunk).await?;
            delivered += chunk.len() as u64;
            observer.progress_download(total, delivered);
        }
        Ok(response)
    }
}
