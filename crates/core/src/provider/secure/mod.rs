//! Adapter for an end-to-end-encrypted back-end whose native SDK owns its
//! own protocol. The engine supplies the SDK's I/O (see [`sdk`]), drives
//! its event pump from a dedicated thread, and maps tag-based completions
//! back onto async operations.

pub mod sdk;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::auth::{hint, AuthContext, Hints, Token};
use crate::error::{Error, Result};
use crate::http::{DownloadSink, UploadSource};
use crate::request::RequestContext;

use self::sdk::{FileShim, SdkEvent, SdkHandle, SdkTag, SecureSdk, TransportShim};
use super::{
    credentials_from_string, credentials_to_string, CloudProvider, FileType, GeneralData, Item,
    LibraryContext, Page, Range,
};

const ROOT_ID: &str = "root";

enum Pending {
    Once(oneshot::Sender<SdkEvent>),
    Read {
        chunks: mpsc::Sender<Bytes>,
        done: oneshot::Sender<std::result::Result<(), sdk::SdkError>>,
    },
}

enum PumpSignal {
    Exec,
    Quit,
}

struct SecureInner {
    sdk: Mutex<Box<dyn SecureSdk>>,
    pending: Mutex<HashMap<SdkTag, Pending>>,
    shim: Arc<TransportShim>,
    files: Arc<FileShim>,
    authorized: AtomicBool,
    wake: std::sync::mpsc::Sender<PumpSignal>,
}

impl SecureInner {
    fn dispatch(&self, events: Vec<SdkEvent>) {
        for event in events {
            let tag = event.tag();
            match event {
                SdkEvent::ReadData(_, data) => {
                    // The pending lock must not be held across the send:
                    // the reader takes it on its abort path. A dropped
                    // receiver means the read was cancelled; the entry
                    // goes away with ReadDone or abort.
                    let sender = match self.pending.lock().unwrap().get(&tag) {
                        Some(Pending::Read { chunks, .. }) => Some(chunks.clone()),
                        _ => None,
                    };
                    if let Some(sender) = sender {
                        let _ = sender.blocking_send(data);
                    }
                }
                SdkEvent::ReadDone(_, result) => {
                    if let Some(Pending::Read { done, .. }) =
                        self.pending.lock().unwrap().remove(&tag)
                    {
                        let _ = done.send(result);
                    }
                }
                other => {
                    if let Some(Pending::Once(tx)) = self.pending.lock().unwrap().remove(&tag) {
                        let _ = tx.send(other);
                    }
                }
            }
        }
    }
}

pub struct Secure {
    inner: Arc<SecureInner>,
    auth: AuthContext,
    context: LibraryContext,
    redirect_uri: String,
    /// Serializes login attempts: concurrent first operations fan into one
    /// login, like concurrent 401s fan into one refresh.
    authorizing: tokio::sync::Mutex<()>,
    pump: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Secure {
    /// Wires the shims into the SDK and starts the pump thread. The SDK is
    /// injected; its internals are not the engine's business.
    pub fn new(
        context: LibraryContext,
        hints: &Hints,
        token: Option<Token>,
        mut raw_sdk: Box<dyn SecureSdk>,
    ) -> Self {
        let (wake_tx, wake_rx) = std::sync::mpsc::channel();
        let shim_wake = wake_tx.clone();
        let shim = Arc::new(TransportShim::new(
            context.transport.clone(),
            Box::new(move || {
                let _ = shim_wake.send(PumpSignal::Exec);
            }),
        ));
        let files = Arc::new(FileShim::new(tokio::runtime::Handle::current()));
        raw_sdk.attach_transport(shim.clone());
        raw_sdk.attach_files(files.clone());

        let inner = Arc::new(SecureInner {
            sdk: Mutex::new(raw_sdk),
            pending: Mutex::new(HashMap::new()),
            shim,
            files,
            authorized: AtomicBool::new(false),
            wake: wake_tx,
        });

        // The dedicated SDK I/O thread: every exec() runs here, under the
        // SDK lock, never on the async runtime.
        let pump_inner = inner.clone();
        let pump = std::thread::spawn(move || {
            while let Ok(signal) = wake_rx.recv() {
                match signal {
                    PumpSignal::Quit => break,
                    PumpSignal::Exec => {
                        let events = {
                            let mut sdk = pump_inner.sdk.lock().unwrap();
                            sdk.exec()
                        };
                        pump_inner.dispatch(events);
                    }
                }
            }
        });

        Self {
            inner,
            auth: AuthContext::new(token),
            redirect_uri: hints.get(hint::REDIRECT_URI).cloned().unwrap_or_default(),
            context,
            authorizing: tokio::sync::Mutex::new(()),
            pump: Mutex::new(Some(pump)),
        }
    }

    fn wake(&self) {
        let _ = self.inner.wake.send(PumpSignal::Exec);
    }

    fn handle_of(&self, id: &str) -> Result<SdkHandle> {
        if id == ROOT_ID {
            let sdk = self.inner.sdk.lock().unwrap();
            return Ok(sdk.root());
        }
        id.parse().map_err(|_| Error::node_not_found())
    }

    fn to_item(&self, node: &sdk::SdkNode) -> Item {
        let file_type = if node.is_directory {
            FileType::Directory
        } else {
            FileType::from_filename(&node.name)
        };
        let mut item = Item::new(node.handle.to_string(), node.name.clone(), file_type);
        item.size = node.size;
        item.timestamp = node
            .modified
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        if !item.is_directory() {
            let size = item.size.unwrap_or(0);
            item.url = Some(self.context.file_daemon_url(self.name(), &item, size));
        }
        item
    }

    /// Registers a pending op, starts it under the SDK lock, and awaits its
    /// completion event. On cancellation the pending entry is removed first
    /// so late completions are dropped.
    async fn run_op(
        &self,
        ctx: &RequestContext,
        start: impl FnOnce(&mut dyn SecureSdk, SdkTag),
    ) -> Result<SdkEvent> {
        let (tx, mut rx) = oneshot::channel();
        let tag = {
            let mut sdk = self.inner.sdk.lock().unwrap();
            let tag = sdk.next_tag();
            self.inner
                .pending
                .lock()
                .unwrap()
                .insert(tag, Pending::Once(tx));
            start(&mut **sdk, tag);
            tag
        };
        self.wake();
        loop {
            tokio::select! {
                event = &mut rx => {
                    return event.map_err(|_| Error::internal("sdk dropped a pending operation"));
                }
                _ = tokio::time::sleep(Duration::from_millis(20)) => {
                    if ctx.aborted() {
                        self.inner.pending.lock().unwrap().remove(&tag);
                        return Err(Error::aborted());
                    }
                }
            }
        }
    }

    async fn run_unit(
        &self,
        ctx: &RequestContext,
        start: impl FnOnce(&mut dyn SecureSdk, SdkTag),
    ) -> Result<()> {
        match self.run_op(ctx, start).await? {
            SdkEvent::Unit(_, result) | SdkEvent::Login(_, result) | SdkEvent::FetchNodes(_, result) => {
                result.map_err(Error::from)
            }
            _ => Err(Error::internal("unexpected sdk completion")),
        }
    }

    async fn run_node(
        &self,
        ctx: &RequestContext,
        start: impl FnOnce(&mut dyn SecureSdk, SdkTag),
    ) -> Result<SdkHandle> {
        match self.run_op(ctx, start).await? {
            SdkEvent::Node(_, result) => result.map_err(Error::from),
            _ => Err(Error::internal("unexpected sdk completion")),
        }
    }

    fn node_item(&self, handle: SdkHandle) -> Result<Item> {
        let sdk = self.inner.sdk.lock().unwrap();
        sdk.node(handle)
            .map(|node| self.to_item(&node))
            .ok_or_else(Error::node_not_found)
    }

    /// Authorizes on demand: session resumption first, then the full
    /// username/password dance, then fetch-nodes. A cancellation observed
    /// before the authorized flag is set always logs the session out so
    /// nothing leaks server-side.
    async fn ensure_authorized(&self, ctx: &RequestContext) -> Result<()> {
        if self.inner.authorized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.authorizing.lock().await;
        if self.inner.authorized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.login_and_fetch(ctx).await;
        if result.is_ok() && !ctx.aborted() {
            self.inner.authorized.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if ctx.aborted() {
            debug!("cancelled before authorization, logging out");
            let mut sdk = self.inner.sdk.lock().unwrap();
            sdk.logout();
            drop(sdk);
            self.wake();
            return Err(Error::aborted());
        }
        result
    }

    async fn login_and_fetch(&self, ctx: &RequestContext) -> Result<()> {
        let token = self.auth.token().await.ok_or_else(Error::unauthorized)?;
        let credentials = credentials_from_string(&token.access_token)?;
        let session = credentials["session"].as_str().and_then(base64_decode);

        let mut logged_in = false;
        if let Some(session) = session {
            match self
                .run_unit(ctx, |sdk, tag| sdk.login_with_session(tag, &session))
                .await
            {
                Ok(()) => logged_in = true,
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => warn!(code = e.code, "session resumption failed, full login"),
            }
        }
        if !logged_in {
            let email = credentials["username"]
                .as_str()
                .ok_or_else(Error::unauthorized)?
                .to_string();
            let key = credentials["password_key"]
                .as_str()
                .and_then(|s| base64_decode(s))
                .ok_or_else(Error::unauthorized)?;
            self.run_unit(ctx, |sdk, tag| sdk.login(tag, &email, &key))
                .await
                .map_err(|e| {
                    if e.is_aborted() {
                        e
                    } else {
                        Error::unauthorized()
                    }
                })?;
            // Re-serialize the fresh session into the token store.
            let session = {
                let sdk = self.inner.sdk.lock().unwrap();
                sdk.dump_session()
            };
            let mut updated = credentials.clone();
            updated["session"] = serde_json::Value::String(base64_encode(&session));
            let blob = credentials_to_string(&updated);
            self.auth.set_token(Token::new(blob.clone(), blob)).await;
        }
        self.run_unit(ctx, |sdk, tag| sdk.fetch_nodes(tag)).await
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Option<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}

impl Drop for Secure {
    fn drop(&mut self) {
        self.inner.shim.cancel_all();
        let _ = self.inner.wake.send(PumpSignal::Quit);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }
    }
}

#[async_trait]
impl CloudProvider for Secure {
    fn name(&self) -> &'static str {
        "secure"
    }

    fn hints(&self) -> Hints {
        let mut hints = Hints::new();
        hints.insert(hint::REDIRECT_URI.into(), self.redirect_uri.clone());
        hints
    }

    fn auth(&self) -> &AuthContext {
        &self.auth
    }

    fn root_directory(&self) -> Item {
        Item::directory(ROOT_ID, "/")
    }

    fn authorize_library_url(&self, state: &str) -> String {
        // No third-party consent page; the daemon serves the login form.
        format!("{}/login?state={}", self.redirect_uri, state)
    }

    /// The "authorization code" is a credentials blob
    /// `{"username": .., "password": ..}`; the stored token replaces the
    /// plaintext password with the derived key.
    async fn exchange_code(&self, _ctx: &RequestContext, code: &str) -> Result<Token> {
        let credentials = credentials_from_string(code)
            .map_err(|_| Error::invalid_authorization_code())?;
        let username = credentials["username"]
            .as_str()
            .ok_or_else(Error::invalid_authorization_code)?;
        let password = credentials["password"]
            .as_str()
            .ok_or_else(Error::invalid_authorization_code)?;
        let key = {
            let sdk = self.inner.sdk.lock().unwrap();
            sdk.password_key(password)
        };
        let blob = credentials_to_string(&serde_json::json!({
            "username": username,
            "password_key": base64_encode(&key),
        }));
        Ok(Token::new(blob.clone(), blob))
    }

    async fn get_item_data(&self, ctx: &RequestContext, id: &str) -> Result<Item> {
        self.ensure_authorized(ctx).await?;
        let handle = self.handle_of(id)?;
        self.node_item(handle)
    }

    async fn list_directory_page(
        &self,
        ctx: &RequestContext,
        item: &Item,
        _page_token: Option<&str>,
    ) -> Result<Page> {
        self.ensure_authorized(ctx).await?;
        let handle = self.handle_of(&item.id)?;
        let sdk = self.inner.sdk.lock().unwrap();
        if sdk.node(handle).is_none() {
            return Err(Error::node_not_found());
        }
        let items = sdk
            .children(handle)
            .iter()
            .map(|node| self.to_item(node))
            .collect();
        // The SDK holds the whole decrypted tree; listings are single-page.
        Ok(Page {
            items,
            next_page_token: None,
        })
    }

    async fn get_item_url(&self, _ctx: &RequestContext, item: &Item) -> Result<String> {
        Ok(self
            .context
            .file_daemon_url(self.name(), item, item.size.unwrap_or(0)))
    }

    async fn create_directory(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        name: &str,
    ) -> Result<Item> {
        self.ensure_authorized(ctx).await?;
        let parent_handle = self.handle_of(&parent.id)?;
        let name = name.to_string();
        let handle = self
            .run_node(ctx, |sdk, tag| sdk.mkdir(tag, parent_handle, &name))
            .await?;
        self.node_item(handle)
    }

    async fn move_item(
        &self,
        ctx: &RequestContext,
        source: &Item,
        destination: &Item,
    ) -> Result<Item> {
        self.ensure_authorized(ctx).await?;
        let handle = self.handle_of(&source.id)?;
        let dest = self.handle_of(&destination.id)?;
        self.run_node(ctx, |sdk, tag| sdk.move_node(tag, handle, dest))
            .await?;
        self.node_item(handle)
    }

    async fn rename_item(&self, ctx: &RequestContext, item: &Item, name: &str) -> Result<Item> {
        self.ensure_authorized(ctx).await?;
        let handle = self.handle_of(&item.id)?;
        let name = name.to_string();
        self.run_unit(ctx, |sdk, tag| sdk.rename(tag, handle, &name))
            .await?;
        self.node_item(handle)
    }

    async fn delete_item(&self, ctx: &RequestContext, item: &Item) -> Result<()> {
        self.ensure_authorized(ctx).await?;
        let handle = self.handle_of(&item.id)?;
        self.run_unit(ctx, |sdk, tag| sdk.unlink(tag, handle)).await
    }

    async fn upload_file(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        filename: &str,
        content: Arc<dyn UploadSource>,
    ) -> Result<Item> {
        self.ensure_authorized(ctx).await?;
        let parent_handle = self.handle_of(&parent.id)?;
        let file_tag = self.inner.files.register(content);
        let name = filename.to_string();
        let result = self
            .run_node(ctx, |sdk, tag| {
                sdk.upload(tag, parent_handle, &name, file_tag)
            })
            .await;
        self.inner.files.remove(file_tag);
        self.node_item(result?)
    }

    async fn download_file(
        &self,
        ctx: &RequestContext,
        item: &Item,
        range: Range,
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        self.ensure_authorized(ctx).await?;
        let handle = self.handle_of(&item.id)?;
        let size = {
            let sdk = self.inner.sdk.lock().unwrap();
            sdk.node(handle)
                .ok_or_else(Error::node_not_found)?
                .size
                .unwrap_or(0)
        };
        let effective = range.clamp_to(size);
        let Some(length) = effective.size.filter(|s| *s > 0) else {
            return Ok(());
        };

        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let (done_tx, mut done_rx) = oneshot::channel();
        let tag = {
            let mut sdk = self.inner.sdk.lock().unwrap();
            let tag = sdk.next_tag();
            self.inner.pending.lock().unwrap().insert(
                tag,
                Pending::Read {
                    chunks: chunk_tx,
                    done: done_tx,
                },
            );
            sdk.read(tag, handle, effective.start, length);
            tag
        };
        self.wake();

        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => {
                    if let Some(chunk) = chunk {
                        sink.write(&chunk).await?;
                    }
                }
                result = &mut done_rx => {
                    // Drain anything that raced the completion.
                    while let Ok(chunk) = chunk_rx.try_recv() {
                        sink.write(&chunk).await?;
                    }
                    return match result {
                        Ok(r) => r.map_err(Error::from),
                        Err(_) => Err(Error::internal("sdk dropped a pending read")),
                    };
                }
                _ = tokio::time::sleep(Duration::from_millis(20)) => {
                    if ctx.aborted() {
                        self.inner.pending.lock().unwrap().remove(&tag);
                        return Err(Error::aborted());
                    }
                }
            }
        }
    }

    async fn general_data(&self, ctx: &RequestContext) -> Result<GeneralData> {
        self.ensure_authorized(ctx).await?;
        let username = self
            .auth
            .token()
            .await
            .and_then(|t| credentials_from_string(&t.access_token).ok())
            .and_then(|c| c["username"].as_str().map(str::to_string))
            .unwrap_or_default();
        match self.run_op(ctx, |sdk, tag| sdk.account_details(tag)).await? {
            SdkEvent::Account(_, result) => {
                let (space_used, space_total) = result.map_err(Error::from)?;
                Ok(GeneralData {
                    username,
                    space_used,
                    space_total,
                })
            }
            _ => Err(Error::internal("unexpected sdk completion")),
        }
    }
}
