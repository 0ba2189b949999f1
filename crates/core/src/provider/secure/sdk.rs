//! The adapter contract demanded of an end-to-end-encrypted native SDK,
//! plus the two shims the engine supplies to it.
//!
//! The SDK owns its protocol and crypto but performs no I/O of its own:
//! HTTP goes through the [`TransportShim`] and upload payload access goes
//! through the [`FileShim`]. The SDK is single-threaded; its event pump
//! (`exec`) is only ever driven under the provider's SDK lock, from the
//! provider's dedicated pump thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::http::{Body, DownloadSink, HttpRequest, HttpTransport, TransferObserver, UploadSource};

pub type SdkTag = u32;
pub type SdkHandle = u64;

/// SDK-level failure taxonomy, mapped onto the unified error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkError {
    Again,
    RateLimit,
    NotFound,
    Expired,
    BadSession,
    Access,
    Exists,
    DecryptionKey,
    Blocked,
    OverQuota,
    Failed,
}

impl SdkError {
    pub fn description(&self) -> &'static str {
        match self {
            SdkError::Again => "request failed, retrying",
            SdkError::RateLimit => "rate limit exceeded",
            SdkError::NotFound => "not found",
            SdkError::Expired => "expired",
            SdkError::BadSession => "bad session id",
            SdkError::Access => "access denied",
            SdkError::Exists => "already exists",
            SdkError::DecryptionKey => "invalid key or decryption error",
            SdkError::Blocked => "blocked",
            SdkError::OverQuota => "over quota",
            SdkError::Failed => "failed permanently",
        }
    }
}

impl From<SdkError> for Error {
    fn from(e: SdkError) -> Self {
        use crate::error::codes;
        let code = match e {
            SdkError::Again | SdkError::RateLimit => codes::TOO_MANY_REQUESTS,
            SdkError::NotFound => codes::NODE_NOT_FOUND,
            SdkError::Expired | SdkError::BadSession => codes::UNAUTHORIZED,
            SdkError::Access | SdkError::Blocked => codes::FORBIDDEN,
            SdkError::Exists => codes::BAD_REQUEST,
            SdkError::DecryptionKey => codes::UNAUTHORIZED,
            SdkError::OverQuota => codes::BANDWIDTH,
            SdkError::Failed => codes::FAILURE,
        };
        Error::new(code, e.description())
    }
}

/// A node in the SDK's decrypted tree.
#[derive(Debug, Clone)]
pub struct SdkNode {
    pub handle: SdkHandle,
    pub parent: SdkHandle,
    pub name: String,
    pub size: Option<u64>,
    pub modified: Option<i64>,
    pub is_directory: bool,
}

/// Completion events produced by the SDK pump.
#[derive(Debug)]
pub enum SdkEvent {
    /// login / session-login finished.
    Login(SdkTag, std::result::Result<(), SdkError>),
    /// fetch-nodes finished; the tree is available afterwards.
    FetchNodes(SdkTag, std::result::Result<(), SdkError>),
    /// mkdir / move / upload / rename resolved to a node handle.
    Node(SdkTag, std::result::Result<SdkHandle, SdkError>),
    /// delete and other void operations.
    Unit(SdkTag, std::result::Result<(), SdkError>),
    /// A chunk of streaming read data.
    ReadData(SdkTag, Bytes),
    /// Streaming read finished.
    ReadDone(SdkTag, std::result::Result<(), SdkError>),
    /// Account details: (space used, space total).
    Account(SdkTag, std::result::Result<(u64, u64), SdkError>),
}

impl SdkEvent {
    pub fn tag(&self) -> SdkTag {
        match self {
            SdkEvent::Login(tag, _)
            | SdkEvent::FetchNodes(tag, _)
            | SdkEvent::Node(tag, _)
            | SdkEvent::Unit(tag, _)
            | SdkEvent::ReadData(tag, _)
            | SdkEvent::ReadDone(tag, _)
            | SdkEvent::Account(tag, _) => *tag,
        }
    }
}

/// What the engine demands of the native SDK. All methods are called under
/// the provider's SDK lock; operations are tag-based and complete through
/// events returned by [`SecureSdk::exec`].
pub trait SecureSdk: Send {
    fn attach_transport(&mut self, shim: Arc<TransportShim>);
    fn attach_files(&mut self, shim: Arc<FileShim>);

    fn next_tag(&mut self) -> SdkTag;

    fn login(&mut self, tag: SdkTag, email: &str, password_key: &[u8]);
    fn login_with_session(&mut self, tag: SdkTag, session: &[u8]);
    /// Derives the long-lived password key from a plaintext password.
    fn password_key(&self, password: &str) -> Vec<u8>;
    /// Serializes the live session for resumption.
    fn dump_session(&self) -> Vec<u8>;

    fn fetch_nodes(&mut self, tag: SdkTag);
    fn root(&self) -> SdkHandle;
    fn node(&self, handle: SdkHandle) -> Option<SdkNode>;
    fn children(&self, handle: SdkHandle) -> Vec<SdkNode>;

    fn read(&mut self, tag: SdkTag, handle: SdkHandle, offset: u64, size: u64);
    /// `file` is a tag previously registered with the [`FileShim`].
    fn upload(&mut self, tag: SdkTag, parent: SdkHandle, name: &str, file: u32);
    fn mkdir(&mut self, tag: SdkTag, parent: SdkHandle, name: &str);
    fn rename(&mut self, tag: SdkTag, handle: SdkHandle, name: &str);
    fn move_node(&mut self, tag: SdkTag, handle: SdkHandle, parent: SdkHandle);
    fn unlink(&mut self, tag: SdkTag, handle: SdkHandle);
    fn account_details(&mut self, tag: SdkTag);

    fn logout(&mut self);

    /// The single-threaded event pump: consumes transport deliveries,
    /// advances protocol state, and returns completions.
    fn exec(&mut self) -> Vec<SdkEvent>;
}

/// I/O completion delivered from the engine transport into the SDK pump.
#[derive(Debug)]
pub enum ShimDelivery {
    Chunk {
        handle: u64,
        data: Bytes,
    },
    Complete {
        handle: u64,
        result: std::result::Result<u16, Error>,
    },
}

struct ShimState {
    next_handle: u64,
    /// Abort marks for live requests. An entry removed by `cancel` makes
    /// in-flight completions drop their deliveries.
    live: HashMap<u64, Arc<AtomicBool>>,
    deliveries: VecDeque<ShimDelivery>,
}

/// Translates SDK HTTP requests into the engine transport. Responses come
/// back as a FIFO of chunk and completion deliveries, drained by the SDK
/// pump; the `wake` callback nudges the provider's pump thread.
pub struct TransportShim {
    transport: Arc<dyn HttpTransport>,
    state: Mutex<ShimState>,
    wake: Box<dyn Fn() + Send + Sync>,
}

struct ShimObserver {
    abort: Arc<AtomicBool>,
}

impl TransferObserver for ShimObserver {
    fn abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

struct ShimSink {
    shim: Arc<TransportShim>,
    handle: u64,
    abort: Arc<AtomicBool>,
}

#[async_trait]
impl DownloadSink for ShimSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(Error::aborted());
        }
        self.shim.push(ShimDelivery::Chunk {
            handle: self.handle,
            data: Bytes::copy_from_slice(chunk),
        });
        Ok(())
    }
}

impl TransportShim {
    pub fn new(transport: Arc<dyn HttpTransport>, wake: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            transport,
            state: Mutex::new(ShimState {
                next_handle: 1,
                live: HashMap::new(),
                deliveries: VecDeque::new(),
            }),
            wake,
        }
    }

    fn push(&self, delivery: ShimDelivery) {
        let mut state = self.state.lock().unwrap();
        let handle = match &delivery {
            ShimDelivery::Chunk { handle, .. } | ShimDelivery::Complete { handle, .. } => *handle,
        };
        if !state.live.contains_key(&handle) {
            return; // cancelled; drop the delivery
        }
        state.deliveries.push_back(delivery);
        drop(state);
        (self.wake)();
    }

    /// Dispatches a POST on behalf of the SDK and returns its opaque
    /// request handle.
    pub fn post(self: &Arc<Self>, url: String, payload: Bytes) -> u64 {
        let abort = Arc::new(AtomicBool::new(false));
        let handle = {
            let mut state = self.state.lock().unwrap();
            let handle = state.next_handle;
            state.next_handle += 1;
            state.live.insert(handle, abort.clone());
            handle
        };
        let shim = self.clone();
        tokio::spawn(async move {
            let request = HttpRequest::post(&url);
            let mut sink = ShimSink {
                shim: shim.clone(),
                handle,
                abort: abort.clone(),
            };
            let observer = Arc::new(ShimObserver {
                abort: abort.clone(),
            });
            let result = shim
                .transport
                .execute(request, Body::Bytes(payload), &mut sink, observer)
                .await;
            if abort.load(Ordering::SeqCst) {
                return;
            }
            shim.push(ShimDelivery::Complete {
                handle,
                result: result.map(|r| r.code),
            });
            let mut state = shim.state.lock().unwrap();
            state.live.remove(&handle);
        });
        handle
    }

    /// Marks the request aborted and frees its shim state; deliveries from
    /// the in-flight transfer are dropped from here on.
    pub fn cancel(&self, handle: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(abort) = state.live.remove(&handle) {
            abort.store(true, Ordering::SeqCst);
        }
        state.deliveries.retain(|d| match d {
            ShimDelivery::Chunk { handle: h, .. } | ShimDelivery::Complete { handle: h, .. } => {
                *h != handle
            }
        });
    }

    /// Drains pending deliveries; called by the SDK from `exec`.
    pub fn take_deliveries(&self) -> Vec<ShimDelivery> {
        let mut state = self.state.lock().unwrap();
        state.deliveries.drain(..).collect()
    }

    /// Cancels everything in flight (provider teardown).
    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap();
        for abort in state.live.values() {
            abort.store(true, Ordering::SeqCst);
        }
        state.live.clear();
        state.deliveries.clear();
    }
}

/// Presents engine upload sources to the SDK as random-access files.
/// Reads run on the pump thread and block on the async source; writes are
/// rejected, since upload payloads are read-only from the SDK's side.
pub struct FileShim {
    runtime: tokio::runtime::Handle,
    files: Mutex<HashMap<u32, Arc<dyn UploadSource>>>,
    next: AtomicU32,
}

impl FileShim {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            files: Mutex::new(HashMap::new()),
            next: AtomicU32::new(1),
        }
    }

    pub fn register(&self, source: Arc<dyn UploadSource>) -> u32 {
        let tag = self.next.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().insert(tag, source);
        tag
    }

    pub fn remove(&self, tag: u32) {
        self.files.lock().unwrap().remove(&tag);
    }

    pub fn size(&self, tag: u32) -> Option<u64> {
        self.files
            .lock()
            .unwrap()
            .get(&tag)
            .and_then(|source| source.size())
    }

    /// Blocking random-access read; only legal from outside the async
    /// runtime (the pump thread).
    pub fn read_at(&self, tag: u32, offset: u64, len: usize) -> Result<Bytes> {
        let source = self
            .files
            .lock()
            .unwrap()
            .get(&tag)
            .cloned()
            .ok_or_else(|| Error::internal("unknown upload file tag"))?;
        self.runtime.block_on(source.read_at(offset, len))
    }

    pub fn write(&self, _tag: u32, _offset: u64, _data: &[u8]) -> Result<()> {
        Err(Error::not_supported("sdk file write"))
    }
}
