//! The local HTTP daemon: the OAuth consent callback endpoint and a
//! `Range`-aware streaming proxy that lets external media players read
//! provider content without cloud plugins.
//!
//! * `GET /?state=<s>&code=<c>` resolves the pending consent matching `s`;
//!   a mismatched or duplicate `state` yields 400 and leaves pending
//!   attempts untouched.
//! * `GET /?state=<s>&id=<opaque>&size=<n>` decodes `opaque` into
//!   `(provider, item id)` and streams the requested byte range.
//! * `GET /login?state=<s>` either redirects to the provider's consent
//!   page or serves a credential form for providers without one.

mod range;

pub use range::parse_range;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use nimbus_core::client::discard;
use nimbus_core::http::ChannelSink;
use nimbus_core::provider::credentials_from_string;
use nimbus_core::{CloudClient, Item, Range};
use serde::Deserialize;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Consent attempts waiting for their authorization code, keyed by state
/// nonce.
#[derive(Default)]
pub struct PendingConsents {
    entries: DashMap<String, ConsentEntry>,
}

struct ConsentEntry {
    /// Where `/login` sends the browser; `None` for credential providers,
    /// which get the built-in form instead.
    authorize_url: Option<String>,
    tx: oneshot::Sender<String>,
}

impl PendingConsents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an attempt and returns the receiver its code arrives on.
    pub fn register(
        &self,
        state: &str,
        authorize_url: Option<String>,
    ) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            state.to_string(),
            ConsentEntry { authorize_url, tx },
        );
        rx
    }

    pub fn abandon(&self, state: &str) {
        self.entries.remove(state);
    }

    /// Delivers `code` to the attempt matching `state`. Returns false for
    /// unknown (mismatched or already-consumed) states.
    pub fn resolve(&self, state: &str, code: &str) -> bool {
        match self.entries.remove(state) {
            Some((_, entry)) => entry.tx.send(code.to_string()).is_ok(),
            None => false,
        }
    }

    fn authorize_url(&self, state: &str) -> Option<Option<String>> {
        self.entries
            .get(state)
            .map(|entry| entry.authorize_url.clone())
    }
}

/// Shared daemon state: the configured providers (for streaming) and the
/// pending consent registry.
#[derive(Clone)]
pub struct DaemonState {
    pub providers: Arc<HashMap<String, CloudClient>>,
    pub consents: Arc<PendingConsents>,
}

pub fn build_router(state: DaemonState) -> Router {
    Router::new()
        .route("/", get(dispatch))
        .route("/login", get(login_page).post(login_submit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until the process exits.
pub async fn serve(state: DaemonState, host: &str, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "daemon listening");
    axum::serve(listener, build_router(state)).await
}

#[derive(Deserialize)]
struct RootQuery {
    state: Option<String>,
    code: Option<String>,
    id: Option<String>,
    size: Option<u64>,
}

async fn dispatch(
    State(state): State<DaemonState>,
    Query(query): Query<RootQuery>,
    headers: axum::http::HeaderMap,
) -> Response {
    match (&query.code, &query.id) {
        (Some(code), None) => auth_callback(&state, query.state.as_deref(), code),
        (None, Some(id)) => {
            stream_item(&state, id, query.size.unwrap_or(0), &headers).await
        }
        _ => (StatusCode::BAD_REQUEST, "unrecognized request").into_response(),
    }
}

fn auth_callback(state: &DaemonState, nonce: Option<&str>, code: &str) -> Response {
    let Some(nonce) = nonce else {
        return (StatusCode::BAD_REQUEST, "missing state").into_response();
    };
    if state.consents.resolve(nonce, code) {
        debug!("consent resolved");
        Html("<html><body>Authorized. You may close this window.</body></html>").into_response()
    } else {
        warn!("consent callback with unknown state");
        (StatusCode::BAD_REQUEST, "unknown state").into_response()
    }
}

async fn stream_item(
    state: &DaemonState,
    opaque: &str,
    size: u64,
    headers: &axum::http::HeaderMap,
) -> Response {
    let Ok(reference) = credentials_from_string(opaque) else {
        return (StatusCode::BAD_REQUEST, "bad item reference").into_response();
    };
    let (Some(provider), Some(item_id)) = (
        reference["p"].as_str().map(str::to_string),
        reference["id"].as_str().map(str::to_string),
    ) else {
        return (StatusCode::BAD_REQUEST, "bad item reference").into_response();
    };
    let Some(client) = state.providers.get(&provider).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown provider").into_response();
    };

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (range, partial) = match range_header.as_deref() {
        None => (Range { start: 0, size: None }, false),
        Some(value) => match parse_range(value, size) {
            Some(range) => (range, true),
            None => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                    "unsatisfiable range",
                )
                    .into_response()
            }
        },
    };

    let item = Item::new(item_id, "", nimbus_core::FileType::Unknown).with_size(size);
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    let request = client.download_file(&item, range, ChannelSink(tx), None, discard);
    // The request handle keeps the transfer alive; dropping the body stream
    // drops the receiver, the sink errors, and the transfer aborts.
    let body_stream = futures::stream::unfold((rx, request), |(mut rx, request)| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), (rx, request)))
    });

    let mut response = axum::body::Body::from_stream(body_stream).into_response();
    let effective = range.clamp_to(size);
    if partial {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        let end = effective.start + effective.size.unwrap_or(0).saturating_sub(1);
        response.headers_mut().insert(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", effective.start, end, size)
                .parse()
                .expect("valid header"),
        );
    }
    if let Some(length) = effective.size {
        response.headers_mut().insert(
            header::CONTENT_LENGTH,
            length.to_string().parse().expect("valid header"),
        );
    }
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().expect("valid header"));
    response
}

#[derive(Deserialize)]
struct LoginQuery {
    state: String,
}

/// The page the library's authorize URL points at: a redirect to the real
/// consent screen for OAuth providers, or a credential form.
async fn login_page(
    State(state): State<DaemonState>,
    Query(query): Query<LoginQuery>,
) -> Response {
    match state.consents.authorize_url(&query.state) {
        Some(Some(url)) => Redirect::temporary(&url).into_response(),
        Some(None) => Html(format!(
            "<html><body><form method=\"post\" action=\"/login?state={}\">\
             <input name=\"username\" placeholder=\"username\"/>\
             <input name=\"password\" type=\"password\" placeholder=\"password\"/>\
             <button type=\"submit\">Sign in</button></form></body></html>",
            urlencoding::encode(&query.state)
        ))
        .into_response(),
        None => (StatusCode::BAD_REQUEST, "unknown state").into_response(),
    }
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

/// Credential-form submission: packs the fields into the opaque blob the
/// credential providers accept as an authorization code.
async fn login_submit(
    State(state): State<DaemonState>,
    Query(query): Query<LoginQuery>,
    axum::Form(form): axum::Form<LoginForm>,
) -> Response {
    let code = nimbus_core::provider::credentials_to_string(&serde_json::json!({
        "username": form.username,
        "password": form.password,
    }));
    if state.consents.resolve(&query.state, &code) {
        Html("<html><body>Signed in. You may close this window.</body></html>").into_response()
    } else {
        (StatusCode::BAD_REQUEST, "unknown state").into_response()
    }
}
