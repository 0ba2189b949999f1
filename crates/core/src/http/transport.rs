use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::trace;

use crate::error::{Error, Result};

use super::{Body, DownloadSink, HttpRequest, HttpResponse, HttpTransport, Method, TransferObserver};

const PAUSE_POLL: Duration = Duration::from_millis(50);
const UPLOAD_CHUNK: usize = 64 * 1024;

/// Default transport over reqwest. Uploads are chunked from the
/// [`UploadSource`](super::UploadSource) so a paused or aborted observer is
/// honored between chunks; downloads are consumed via `bytes_stream`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    no_redirect: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            no_redirect: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
        }
    }

    fn method(m: Method) -> reqwest::Method {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_unpaused(observer: &dyn TransferObserver) -> Result<()> {
    if observer.abort() {
        return Err(Error::aborted());
    }
    while observer.paused() {
        if observer.abort() {
            return Err(Error::aborted());
        }
        tokio::time::sleep(PAUSE_POLL).await;
    }
    Ok(())
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        body: Body,
        sink: &mut dyn DownloadSink,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<HttpResponse> {
        if observer.abort() {
            return Err(Error::aborted());
        }

        let client = if request.follow_redirects {
            &self.client
        } else {
            &self.no_redirect
        };

        let mut builder = client
            .request(Self::method(request.method), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let builder = match body {
            Body::Empty => builder,
            Body::Bytes(bytes) => {
                let total = bytes.len() as u64;
                observer.progress_upload(total, 0);
                builder.body(bytes)
            }
            Body::Source(source) => {
                // Pull the source chunk by chunk so abort/pause take effect
                // mid-upload and progress is reported as bytes leave.
                let total = source.size().unwrap_or(0);
                let observer = observer.clone();
                let stream = futures::stream::try_unfold(0u64, move |offset| {
                    let source = source.clone();
                    let observer = observer.clone();
                    async move {
                        wait_unpaused(observer.as_ref()).await?;
                        let chunk = source.read_at(offset, UPLOAD_CHUNK).await?;
                        if chunk.is_empty() {
                            return Ok::<_, Error>(None);
                        }
                        let sent = offset + chunk.len() as u64;
                        observer.progress_upload(if total == 0 { sent } else { total }, sent);
                        Ok(Some((chunk, sent)))
                    }
                });
                builder.body(reqwest::Body::wrap_stream(stream))
            }
        };

        let response = builder.send().await.map_err(Error::from)?;

        let code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let total = response.content_length().unwrap_or(0);
        trace!(url = %request.url, code, "http response");
        let result = HttpResponse { code, headers };
        sink.begin(&result);

        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(Error::from)?;
            wait_unpaused(observer.as_ref()).await?;
            sink.write(&chunk).await?;
            received += chunk.len() as u64;
            observer.progress_download(total, received);
        }

        Ok(result)
    }
}
