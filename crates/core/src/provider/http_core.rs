//! The default build → authorize → send → parse pipeline shared by every
//! HTTP-backed provider: credential stamping, one reauthorization on 401,
//! backoff on transient failures, and range-resume for interrupted
//! streaming downloads.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::{AuthContext, OAuth2Config, Token};
use crate::error::{Error, Result};
use crate::http::{
    Body, DownloadSink, HttpRequest, HttpResponse, HttpTransport, NullObserver, VecSink,
};
use crate::request::{RequestContext, RetryPolicy};

use super::Range;

/// Per-provider credential stamping and refresh. `authorize` is pure
/// request rewriting (Bearer header, SigV4 signature); `refresh` runs the
/// provider's refresh-token or re-login flow.
#[async_trait]
pub trait ProviderAuth: Send + Sync {
    fn authorize(
        &self,
        request: HttpRequest,
        body: &Body,
        token: Option<&Token>,
    ) -> Result<HttpRequest>;

    async fn refresh(&self, ctx: &RequestContext, prior: Option<Token>) -> Result<Token>;

    /// Provider-specific mapping of "session expired" responses.
    fn session_expired(&self, response: &HttpResponse) -> bool {
        response.code == 401
    }
}

/// Routes the body by status: 2xx bytes go to the caller's sink, anything
/// else is buffered for the error description. Also records whether the
/// server supports byte ranges, for resume decisions after mid-body
/// failures (headers are gone by then).
struct RoutingSink<'a> {
    inner: &'a mut dyn DownloadSink,
    error_body: Vec<u8>,
    success: bool,
    delivered: u64,
    resumable: bool,
}

impl<'a> RoutingSink<'a> {
    fn new(inner: &'a mut dyn DownloadSink) -> Self {
        Self {
            inner,
            error_body: Vec::new(),
            success: false,
            delivered: 0,
            resumable: false,
        }
    }

    fn error_description(&self, code: u16) -> String {
        let body = String::from_utf8_lossy(&self.error_body);
        let body = body.trim();
        if body.is_empty() {
            format!("http error {code}")
        } else {
            let mut text = body.chars().take(256).collect::<String>();
            if body.chars().count() > 256 {
                text.push_str("...");
            }
            text
        }
    }
}

#[async_trait]
impl DownloadSink for RoutingSink<'_> {
    fn begin(&mut self, response: &crate::http::HttpResponse) {
        self.success = response.is_success();
        self.resumable = response.code == 206
            || response
                .header("accept-ranges")
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.success {
            self.delivered += chunk.len() as u64;
            self.inner.write(chunk).await
        } else {
            // Error bodies are small; cap the buffer anyway.
            let remaining = 4096usize.saturating_sub(self.error_body.len());
            self.error_body
                .extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            Ok(())
        }
    }
}

/// Shared state wired into every HTTP-backed provider: the transport, the
/// auth context, and the retry policy.
pub struct HttpCore {
    pub transport: Arc<dyn HttpTransport>,
    pub auth: AuthContext,
    pub retry: RetryPolicy,
}

impl HttpCore {
    pub fn new(transport: Arc<dyn HttpTransport>, auth: AuthContext) -> Self {
        Self {
            transport,
            auth,
            retry: RetryPolicy::default(),
        }
    }

    /// Runs one operation through the default pipeline. `build` is invoked
    /// per attempt so retries and reauthorized retries see fresh state.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        auth: &dyn ProviderAuth,
        build: &(dyn Fn(Option<&Token>) -> (HttpRequest, Body) + Send + Sync),
        sink: &mut dyn DownloadSink,
    ) -> Result<HttpResponse> {
        let mut attempt = 0u32;
        let mut reauths = 0u32;
        loop {
            ctx.check_aborted()?;
            let token = self.auth.token().await;
            let generation = self.auth.generation().await;
            let (request, body) = build(token.as_ref());
            let request = auth.authorize(request, &body, token.as_ref())?;
            let url = request.url.clone();

            let mut routing = RoutingSink::new(sink);
            let sent = self
                .transport
                .execute(request, body, &mut routing, ctx.observer())
                .await;

            match sent {
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    // Network-level failure. Blind retry is only safe when
                    // nothing reached the caller's sink yet.
                    if routing.delivered == 0 && attempt + 1 < self.retry.max_attempts {
                        warn!(%url, code = e.code, attempt, "transport failure, retrying");
                        self.retry.wait(attempt, ctx).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    let error = Error::http(response.code, routing.error_description(response.code));
                    if auth.session_expired(&response) && reauths < self.auth.max_reauth_attempts {
                        reauths += 1;
                        debug!(%url, "session expired, reauthorizing");
                        self.auth
                            .reauthorize(generation, |prior| auth.refresh(ctx, prior))
                            .await
                            .map_err(|_| Error::unauthorized())?;
                        continue;
                    }
                    if error.is_retryable() && attempt + 1 < self.retry.max_attempts {
                        warn!(%url, code = response.code, attempt, "transient failure, retrying");
                        self.retry.wait(attempt, ctx).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    /// `execute` with the body buffered and parsed as JSON.
    pub async fn fetch_json(
        &self,
        ctx: &RequestContext,
        auth: &dyn ProviderAuth,
        build: &(dyn Fn(Option<&Token>) -> (HttpRequest, Body) + Send + Sync),
    ) -> Result<serde_json::Value> {
        let mut sink = VecSink::default();
        self.execute(ctx, auth, build, &mut sink).await?;
        if sink.0.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&sink.0)?)
    }

    /// `execute` with the body buffered raw.
    pub async fn fetch_bytes(
        &self,
        ctx: &RequestContext,
        auth: &dyn ProviderAuth,
        build: &(dyn Fn(Option<&Token>) -> (HttpRequest, Body) + Send + Sync),
    ) -> Result<Vec<u8>> {
        let mut sink = VecSink::default();
        self.execute(ctx, auth, build, &mut sink).await?;
        Ok(sink.0)
    }

    /// Streaming download with range resume: when the connection dies
    /// mid-body and the server advertised `Accept-Ranges: bytes`, the
    /// request is reissued from the last delivered byte instead of
    /// restarting.
    pub async fn stream_download(
        &self,
        ctx: &RequestContext,
        auth: &dyn ProviderAuth,
        range: Range,
        build: &(dyn Fn(Option<&Token>, &Range) -> (HttpRequest, Body) + Send + Sync),
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        let mut delivered: u64 = 0;
        let mut attempt = 0u32;
        loop {
            ctx.check_aborted()?;
            let token = self.auth.token().await;
            let generation = self.auth.generation().await;
            let current = Range {
                start: range.start + delivered,
                size: range.size.map(|s| s - delivered),
            };
            let (request, body) = build(token.as_ref(), &current);
            let request = auth.authorize(request, &body, token.as_ref())?;

            let mut routing = RoutingSink::new(sink);
            let sent = self
                .transport
                .execute(request, body, &mut routing, ctx.observer())
                .await;
            let partial = routing.delivered;
            let can_resume = routing.resumable || partial == 0;
            delivered += partial;

            match sent {
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    if can_resume && attempt + 1 < self.retry.max_attempts {
                        warn!(code = e.code, delivered, "download interrupted, resuming");
                        self.retry.wait(attempt, ctx).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
                Ok(response) if response.is_success() => return Ok(()),
                Ok(response) => {
                    let error = Error::http(response.code, routing.error_description(response.code));
                    if auth.session_expired(&response) && partial == 0 {
                        self.auth
                            .reauthorize(generation, |prior| auth.refresh(ctx, prior))
                            .await
                            .map_err(|_| Error::unauthorized())?;
                        continue;
                    }
                    if error.is_retryable() && attempt + 1 < self.retry.max_attempts {
                        self.retry.wait(attempt, ctx).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }
}

/// Bearer-token stamping plus the standard OAuth2 refresh flow, shared by
/// the OAuth-family adapters.
pub struct BearerAuth {
    pub transport: Arc<dyn HttpTransport>,
    pub oauth: OAuth2Config,
}

impl BearerAuth {
    async fn token_endpoint(&self, request: HttpRequest, body: Body) -> Result<serde_json::Value> {
        let mut sink = VecSink::default();
        let response = self
            .transport
            .execute(request, body, &mut sink, Arc::new(NullObserver))
            .await?;
        // Error bodies are not always JSON; keep the status either way.
        let value: serde_json::Value =
            serde_json::from_slice(&sink.0).unwrap_or(serde_json::Value::Null);
        if !response.is_success() {
            let description = value["error_description"]
                .as_str()
                .or(value["error"].as_str())
                .unwrap_or("token endpoint failure")
                .to_string();
            return Err(Error::http(response.code, description));
        }
        Ok(value)
    }

    pub async fn exchange_code(&self, ctx: &RequestContext, code: &str) -> Result<Token> {
        ctx.check_aborted()?;
        let (request, body) = self.oauth.exchange_request(code);
        let value = self.token_endpoint(request, body).await?;
        OAuth2Config::parse_token_response(&value, None)
    }
}

#[async_trait]
impl ProviderAuth for BearerAuth {
    fn authorize(
        &self,
        request: HttpRequest,
        _body: &Body,
        token: Option<&Token>,
    ) -> Result<HttpRequest> {
        let token = token.ok_or_else(Error::unauthorized)?;
        Ok(request.header(
            "Authorization",
            format!("Bearer {}", token.access_token),
        ))
    }

    async fn refresh(&self, ctx: &RequestContext, prior: Option<Token>) -> Result<Token> {
        ctx.check_aborted()?;
        let prior = prior.filter(|t| !t.refresh_token.is_empty());
        let Some(prior) = prior else {
            return Err(Error::unauthorized());
        };
        let (request, body) = self.oauth.refresh_request(&prior.refresh_token);
        let value = self.token_endpoint(request, body).await?;
        OAuth2Config::parse_token_response(&value, Some(&prior.refresh_token))
    }
}
