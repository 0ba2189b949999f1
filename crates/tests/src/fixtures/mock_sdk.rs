//! In-memory stand-in for an end-to-end-encrypted native SDK. Login runs a
//! real round trip through the engine's transport shim (so tests exercise
//! the delivery FIFO and pump); tree operations resolve on the next pump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use nimbus_core::provider::secure::sdk::{
    FileShim, SdkError, SdkEvent, SdkHandle, SdkNode, SdkTag, SecureSdk, ShimDelivery,
    TransportShim,
};

pub const ROOT_HANDLE: SdkHandle = 1;

struct MockNode {
    node: SdkNode,
    data: Vec<u8>,
}

enum PendingOp {
    /// Login waiting on its transport round trip.
    Login {
        tag: SdkTag,
        http: u64,
        accepted: bool,
    },
    /// Resolves on the next pump.
    Ready(SdkEvent),
}

pub struct MockSdk {
    transport: Option<Arc<TransportShim>>,
    files: Option<Arc<FileShim>>,
    accounts: HashMap<String, Vec<u8>>,
    nodes: HashMap<SdkHandle, MockNode>,
    next_handle: SdkHandle,
    next_tag: SdkTag,
    session: Option<Vec<u8>>,
    logged_in: bool,
    ops: Vec<PendingOp>,
    pub logouts: Arc<AtomicU32>,
}

impl MockSdk {
    /// `accounts` maps emails to plaintext passwords.
    pub fn new(accounts: &[(&str, &str)]) -> Self {
        let mut sdk = Self {
            transport: None,
            files: None,
            accounts: accounts
                .iter()
                .map(|(email, password)| (email.to_string(), derive_key(password)))
                .collect(),
            nodes: HashMap::new(),
            next_handle: ROOT_HANDLE + 1,
            next_tag: 1,
            session: None,
            logged_in: false,
            ops: Vec::new(),
            logouts: Arc::new(AtomicU32::new(0)),
        };
        sdk.nodes.insert(
            ROOT_HANDLE,
            MockNode {
                node: SdkNode {
                    handle: ROOT_HANDLE,
                    parent: 0,
                    name: "/".to_string(),
                    size: None,
                    modified: None,
                    is_directory: true,
                },
                data: Vec::new(),
            },
        );
        sdk
    }

    /// Seeds a file under the root.
    pub fn with_file(mut self, name: &str, data: &[u8]) -> Self {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.nodes.insert(
            handle,
            MockNode {
                node: SdkNode {
                    handle,
                    parent: ROOT_HANDLE,
                    name: name.to_string(),
                    size: Some(data.len() as u64),
                    modified: Some(1_700_000_000),
                    is_directory: false,
                },
                data: data.to_vec(),
            },
        );
        self
    }

    fn push_ready(&mut self, event: SdkEvent) {
        self.ops.push(PendingOp::Ready(event));
    }
}

fn derive_key(password: &str) -> Vec<u8> {
    format!("key-{password}").into_bytes()
}

impl SecureSdk for MockSdk {
    fn attach_transport(&mut self, shim: Arc<TransportShim>) {
        self.transport = Some(shim);
    }

    fn attach_files(&mut self, shim: Arc<FileShim>) {
        self.files = Some(shim);
    }

    fn next_tag(&mut self) -> SdkTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    fn login(&mut self, tag: SdkTag, email: &str, password_key: &[u8]) {
        let accepted = self.accounts.get(email).is_some_and(|k| k == password_key);
        let shim = self.transport.as_ref().expect("transport attached").clone();
        let http = shim.post(
            "https://mock.sdk/login".to_string(),
            Bytes::from(email.to_string()),
        );
        if accepted {
            self.session = Some(format!("session-{email}").into_bytes());
        }
        self.ops.push(PendingOp::Login {
            tag,
            http,
            accepted,
        });
    }

    fn login_with_session(&mut self, tag: SdkTag, session: &[u8]) {
        let ok = self.session.as_deref() == Some(session) && !session.is_empty();
        // Accept any previously-issued session blob for fresh SDK
        // instances.
        let ok = ok || session.starts_with(b"session-");
        if ok {
            self.session = Some(session.to_vec());
            self.logged_in = true;
            self.push_ready(SdkEvent::Login(tag, Ok(())));
        } else {
            self.push_ready(SdkEvent::Login(tag, Err(SdkError::BadSession)));
        }
    }

    fn password_key(&self, password: &str) -> Vec<u8> {
        derive_key(password)
    }

    fn dump_session(&self) -> Vec<u8> {
        self.session.clone().unwrap_or_default()
    }

    fn fetch_nodes(&mut self, tag: SdkTag) {
        let result = if self.logged_in {
            Ok(())
        } else {
            Err(SdkError::Access)
        };
        self.push_ready(SdkEvent::FetchNodes(tag, result));
    }

    fn root(&self) -> SdkHandle {
        ROOT_HANDLE
    }

    fn node(&self, handle: SdkHandle) -> Option<SdkNode> {
        self.nodes.get(&handle).map(|n| n.node.clone())
    }

    fn children(&self, handle: SdkHandle) -> Vec<SdkNode> {
        self.nodes
            .values()
            .filter(|n| n.node.parent == handle && n.node.handle != ROOT_HANDLE)
            .map(|n| n.node.clone())
            .collect()
    }

    fn read(&mut self, tag: SdkTag, handle: SdkHandle, offset: u64, size: u64) {
        match self.nodes.get(&handle) {
            None => self.push_ready(SdkEvent::ReadDone(tag, Err(SdkError::NotFound))),
            Some(node) => {
                let start = (offset as usize).min(node.data.len());
                let end = (start + size as usize).min(node.data.len());
                let data = Bytes::copy_from_slice(&node.data[start..end]);
                self.push_ready(SdkEvent::ReadData(tag, data));
                self.push_ready(SdkEvent::ReadDone(tag, Ok(())));
            }
        }
    }

    fn upload(&mut self, tag: SdkTag, parent: SdkHandle, name: &str, file: u32) {
        let files = self.files.as_ref().expect("files attached").clone();
        let size = files.size(file).unwrap_or(0);
        let data = match files.read_at(file, 0, size as usize) {
            Ok(data) => data.to_vec(),
            Err(_) => {
                self.push_ready(SdkEvent::Node(tag, Err(SdkError::Failed)));
                return;
            }
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.nodes.insert(
            handle,
            MockNode {
                node: SdkNode {
                    handle,
                    parent,
                    name: name.to_string(),
                    size: Some(data.len() as u64),
                    modified: Some(1_700_000_001),
                    is_directory: false,
                },
                data,
            },
        );
        self.push_ready(SdkEvent::Node(tag, Ok(handle)));
    }

    fn mkdir(&mut self, tag: SdkTag, parent: SdkHandle, name: &str) {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.nodes.insert(
            handle,
            MockNode {
                node: SdkNode {
                    handle,
                    parent,
                    name: name.to_string(),
                    size: None,
                    modified: None,
                    is_directory: true,
                },
                data: Vec::new(),
            },
        );
        self.push_ready(SdkEvent::Node(tag, Ok(handle)));
    }

    fn rename(&mut self, tag: SdkTag, handle: SdkHandle, name: &str) {
        match self.nodes.get_mut(&handle) {
            Some(node) => {
                node.node.name = name.to_string();
                self.push_ready(SdkEvent::Unit(tag, Ok(())));
            }
            None => self.push_ready(SdkEvent::Unit(tag, Err(SdkError::NotFound))),
        }
    }

    fn move_node(&mut self, tag: SdkTag, handle: SdkHandle, parent: SdkHandle) {
        match self.nodes.get_mut(&handle) {
            Some(node) => {
                node.node.parent = parent;
                self.push_ready(SdkEvent::Node(tag, Ok(handle)));
            }
            None => self.push_ready(SdkEvent::Node(tag, Err(SdkError::NotFound))),
        }
    }

    fn unlink(&mut self, tag: SdkTag, handle: SdkHandle) {
        let result = match self.nodes.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(SdkError::NotFound),
        };
        self.push_ready(SdkEvent::Unit(tag, result));
    }

    fn account_details(&mut self, tag: SdkTag) {
        let used: u64 = self.nodes.values().map(|n| n.data.len() as u64).sum();
        self.push_ready(SdkEvent::Account(tag, Ok((used, 1 << 30))));
    }

    fn logout(&mut self) {
        self.logged_in = false;
        self.session = None;
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }

    fn exec(&mut self) -> Vec<SdkEvent> {
        let deliveries = self
            .transport
            .as_ref()
            .map(|shim| shim.take_deliveries())
            .unwrap_or_default();

        let mut events = Vec::new();
        let mut remaining = Vec::new();
        for op in self.ops.drain(..) {
            match op {
                PendingOp::Ready(event) => events.push(event),
                PendingOp::Login {
                    tag,
                    http,
                    accepted,
                } => {
                    let completed = deliveries.iter().any(|d| {
                        matches!(d, ShimDelivery::Complete { handle, .. } if *handle == http)
                    });
                    if completed {
                        if accepted {
                            self.logged_in = true;
                            events.push(SdkEvent::Login(tag, Ok(())));
                        } else {
                            events.push(SdkEvent::Login(tag, Err(SdkError::Access)));
                        }
                    } else {
                        remaining.push(PendingOp::Login {
                            tag,
                            http,
                            accepted,
                        });
                    }
                }
            }
        }
        self.ops = remaining;
        events
    }
}
