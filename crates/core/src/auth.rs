//! Authentication state: token storage, the OAuth2 code/refresh dance, and
//! the single-flight reauthorization arbitration used when concurrent
//! requests hit a 401.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{Body, HttpRequest};

/// Access/refresh token pair. Rewritten atomically after every successful
/// refresh or code exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
}

impl Token {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access_token: access.into(),
            refresh_token: refresh.into(),
        }
    }
}

/// Recognized hint keys. Unknown keys are ignored; each provider documents
/// which ones it honors.
pub mod hint {
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const STATE: &str = "state";
    pub const TEMPORARY_DIRECTORY: &str = "temporary_directory";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const METADATA_URL: &str = "metadata_url";
    pub const FILE_URL: &str = "file_url";
    pub const HTTP_SERVER: &str = "http_server";
    pub const AWS_REGION: &str = "aws_region";
    pub const PERMISSION: &str = "permission";
}

pub type Hints = HashMap<String, String>;

/// The portable serialization of `{provider, access, refresh}`:
/// base64 of a UTF-8 JSON object `{"p": .., "t": .., "r": ..}`.
pub mod envelope {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Wire {
        p: String,
        t: String,
        r: String,
    }

    pub fn encode(provider: &str, token: &Token) -> String {
        let wire = Wire {
            p: provider.to_string(),
            t: token.access_token.clone(),
            r: token.refresh_token.clone(),
        };
        BASE64.encode(serde_json::to_string(&wire).expect("envelope is serializable"))
    }

    /// Accepts both the base64 wrapping and (for backward compatibility)
    /// a raw JSON object, which is rewritten wrapped on the next save.
    pub fn decode(input: &str) -> Result<(String, Token)> {
        let json = match BASE64.decode(input.trim()) {
            Ok(bytes) => String::from_utf8(bytes)
                .map_err(|_| Error::failure("token envelope is not UTF-8"))?,
            Err(_) => input.trim().to_string(),
        };
        let wire: Wire = serde_json::from_str(&json)
            .map_err(|_| Error::failure("malformed token envelope"))?;
        Ok((wire.p, Token::new(wire.t, wire.r)))
    }
}

/// States of the authentication machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    NoToken,
    AwaitingConsent,
    HaveCode,
    HaveToken,
    Refreshing,
    Failed,
}

struct AuthSlot {
    token: Option<Token>,
    status: AuthStatus,
    /// Bumped on every successful token write; used to detect that another
    /// request already refreshed while we waited for the reauth lock.
    generation: u64,
}

/// Per-provider authentication state. Token reads copy out under the lock;
/// token writes only ever happen while holding it.
pub struct AuthContext {
    slot: Mutex<AuthSlot>,
    reauth: Mutex<()>,
    pub max_reauth_attempts: u32,
}

impl AuthContext {
    pub fn new(token: Option<Token>) -> Self {
        let status = if token.is_some() {
            AuthStatus::HaveToken
        } else {
            AuthStatus::NoToken
        };
        Self {
            slot: Mutex::new(AuthSlot {
                token,
                status,
                generation: 0,
            }),
            reauth: Mutex::new(()),
            max_reauth_attempts: 1,
        }
    }

    pub async fn token(&self) -> Option<Token> {
        self.slot.lock().await.token.clone()
    }

    pub async fn status(&self) -> AuthStatus {
        self.slot.lock().await.status
    }

    pub async fn generation(&self) -> u64 {
        self.slot.lock().await.generation
    }

    pub async fn set_status(&self, status: AuthStatus) {
        self.slot.lock().await.status = status;
    }

    pub async fn set_token(&self, token: Token) {
        let mut slot = self.slot.lock().await;
        slot.token = Some(token);
        slot.status = AuthStatus::HaveToken;
        slot.generation += 1;
    }

    /// Single-flight reauthorization. `used_generation` is the generation of
    /// the token that just failed; if it is stale by the time the reauth
    /// lock is acquired, another request already refreshed and the current
    /// token is returned without issuing a second refresh.
    pub async fn reauthorize<F, Fut>(&self, used_generation: u64, refresh: F) -> Result<Token>
    where
        F: FnOnce(Option<Token>) -> Fut,
        Fut: Future<Output = Result<Token>>,
    {
        let _guard = self.reauth.lock().await;
        {
            let slot = self.slot.lock().await;
            if slot.generation != used_generation {
                if let Some(token) = slot.token.clone() {
                    debug!("reauthorize: token already refreshed by a concurrent request");
                    return Ok(token);
                }
            }
        }
        self.set_status(AuthStatus::Refreshing).await;
        let prior = self.token().await;
        match refresh(prior).await {
            Ok(token) => {
                self.set_token(token.clone()).await;
                Ok(token)
            }
            Err(e) => {
                warn!(code = e.code, "reauthorization failed");
                self.set_status(AuthStatus::Failed).await;
                Err(e)
            }
        }
    }
}

/// The consent front-end: shows an authorization URL to the user and
/// resolves with the code posted back to the redirect endpoint. `state` is
/// the nonce the callback must echo for the code to be accepted.
#[async_trait]
pub trait ConsentUi: Send + Sync {
    async fn request_authorization_code(&self, authorize_url: &str, state: &str)
        -> Result<String>;
}

/// Request construction for the standard OAuth2 authorization-code flow;
/// the non-OAuth providers build their own credential blobs instead.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scope: Option<String>,
}

impl OAuth2Config {
    /// The URL the consent UI opens. Embeds `redirect_uri` and the per-attempt
    /// `state` nonce.
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&state={}&access_type=offline",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state),
        );
        if let Some(scope) = &self.scope {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(scope));
        }
        url
    }

    pub fn exchange_request(&self, code: &str) -> (HttpRequest, Body) {
        let request = HttpRequest::post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded");
        let body = Body::form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", &self.redirect_uri),
        ]);
        (request, body)
    }

    pub fn refresh_request(&self, refresh_token: &str) -> (HttpRequest, Body) {
        let request = HttpRequest::post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded");
        let body = Body::form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ]);
        (request, body)
    }

    /// Parses a token endpoint response. Providers that omit the refresh
    /// token on refresh keep the previous one.
    pub fn parse_token_response(
        value: &serde_json::Value,
        previous_refresh: Option<&str>,
    ) -> Result<Token> {
        let access = value["access_token"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(Error::invalid_authorization_code)?;
        let refresh = value["refresh_token"]
            .as_str()
            .or(previous_refresh)
            .unwrap_or_default();
        Ok(Token::new(access, refresh))
    }
}
