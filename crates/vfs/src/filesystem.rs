use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nimbus_core::client::discard;
use nimbus_core::request::wait_done;
use nimbus_core::{AbstractRequest, CloudClient, Error, FileType, Item, Range, Request, Result};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::node::{CreatedNode, FileSource, Inode, NodeTable, ROOT_INODE};
use crate::sanitize::sanitize;

/// Public snapshot of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub inode: Inode,
    pub filename: String,
    pub file_type: FileType,
    pub size: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

struct RequestData {
    request: Arc<dyn AbstractRequest>,
}

struct FsInner {
    /// Configured providers by label; read from many tasks concurrently.
    providers: DashMap<String, CloudClient>,
    /// The inode-keyed state stays behind one async mutex: its maps carry
    /// cross-referencing invariants (id bijection, directory membership)
    /// that must change together.
    table: Mutex<NodeTable>,
    temporary_directory: PathBuf,
    requests: std::sync::Mutex<VecDeque<RequestData>>,
    cancelled: std::sync::Mutex<VecDeque<Arc<dyn AbstractRequest>>>,
    request_notify: Notify,
    cancel_notify: Notify,
    running: AtomicBool,
}

impl FsInner {
    /// Registers an in-flight provider call for the cleanup worker. After
    /// shutdown has begun new requests are cancelled on arrival.
    fn track(&self, request: Arc<dyn AbstractRequest>) {
        if !self.running.load(Ordering::SeqCst) {
            request.cancel();
        }
        self.requests
            .lock()
            .unwrap()
            .push_back(RequestData { request });
        self.request_notify.notify_one();
    }

    fn push_cancelled(&self, request: Arc<dyn AbstractRequest>) {
        request.cancel();
        self.cancelled.lock().unwrap().push_back(request);
        self.cancel_notify.notify_one();
    }
}

/// The inode-keyed cache over one or more providers.
pub struct FileSystem {
    inner: Arc<FsInner>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    canceller: Mutex<Option<JoinHandle<()>>>,
}

impl FileSystem {
    pub fn new(providers: Vec<CloudClient>, temporary_directory: PathBuf) -> Self {
        let mut table = NodeTable::new();
        let provider_map = DashMap::new();

        // Root node plus one pseudo-directory per provider.
        table.nodes.insert(
            ROOT_INODE,
            crate::node::Node {
                inode: ROOT_INODE,
                provider: String::new(),
                item: Item::directory("", "/"),
                size: 0,
                upload_request: None,
            },
        );
        let mut root_children = Vec::new();
        for client in providers {
            let label = client.name().to_string();
            let inode = table.allocate();
            let mut item = client.root_directory();
            item.filename = label.clone();
            table.nodes.insert(
                inode,
                crate::node::Node {
                    inode,
                    provider: label.clone(),
                    item,
                    size: 0,
                    upload_request: None,
                },
            );
            table.auth_nodes.insert(label.clone(), inode);
            root_children.push(inode);
            provider_map.insert(label, client);
        }
        table.directories.insert(ROOT_INODE, root_children);
        table.listed.insert(ROOT_INODE);

        let inner = Arc::new(FsInner {
            providers: provider_map,
            table: Mutex::new(table),
            temporary_directory,
            requests: std::sync::Mutex::new(VecDeque::new()),
            cancelled: std::sync::Mutex::new(VecDeque::new()),
            request_notify: Notify::new(),
            cancel_notify: Notify::new(),
            running: AtomicBool::new(true),
        });

        // Cleanup worker: drains completed entries from the request deque.
        let cleanup_inner = inner.clone();
        let cleanup = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cleanup_inner.request_notify.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {}
                }
                let mut requests = cleanup_inner.requests.lock().unwrap();
                requests.retain(|r| !r.request.is_done());
                let drained = requests.is_empty();
                drop(requests);
                if !cleanup_inner.running.load(Ordering::SeqCst) && drained {
                    break;
                }
            }
        });

        // Cancellation worker: waits each cancelled request to completion.
        let cancel_inner = inner.clone();
        let canceller = tokio::spawn(async move {
            loop {
                let next = cancel_inner.cancelled.lock().unwrap().pop_front();
                match next {
                    Some(request) => wait_done(request.as_ref()).await,
                    None => {
                        if !cancel_inner.running.load(Ordering::SeqCst) {
                            break;
                        }
                        cancel_inner.cancel_notify.notified().await;
                    }
                }
            }
        });

        Self {
            inner,
            cleanup: Mutex::new(Some(cleanup)),
            canceller: Mutex::new(Some(canceller)),
        }
    }

    /// Cancels every in-flight request and joins both workers. Upload
    /// cache files are removed by their upload watchers as the cancelled
    /// uploads deliver.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let pending: Vec<_> = {
            let mut requests = self.inner.requests.lock().unwrap();
            requests.drain(..).map(|r| r.request).collect()
        };
        for request in pending {
            self.inner.push_cancelled(request);
        }
        self.inner.request_notify.notify_one();
        self.inner.cancel_notify.notify_one();
        if let Some(handle) = self.canceller.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.cleanup.lock().await.take() {
            let _ = handle.await;
        }
        debug!("file system shut down");
    }

    fn client(&self, provider: &str) -> Result<CloudClient> {
        self.inner
            .providers
            .get(provider)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::invalid_argument(format!("unknown provider {provider}")))
    }

    /// Tracks `request` and awaits its outcome.
    async fn run<T: Clone + Send + 'static>(&self, request: Request<T>) -> Result<T> {
        self.inner.track(Arc::new(request.clone()));
        request.result().await
    }

    fn info(node: &crate::node::Node) -> NodeInfo {
        NodeInfo {
            inode: node.inode,
            filename: node.item.filename.clone(),
            file_type: node.item.file_type,
            size: node.size,
            timestamp: node.item.timestamp,
        }
    }

    pub async fn getattr(&self, inode: Inode) -> Result<NodeInfo> {
        let table = self.inner.table.lock().await;
        table.get(inode).map(Self::info)
    }

    /// Provider label and provider-side item for a resident node; used by
    /// consumers that hand items straight to a client (CLI transfers).
    pub async fn item_of(&self, inode: Inode) -> Result<(String, Item)> {
        let table = self.inner.table.lock().await;
        let node = table.get(inode)?;
        Ok((node.provider.clone(), node.item.clone()))
    }

    /// Resolves a `/`-separated path from the root, listing intermediate
    /// directories as needed (each listing consumes all pages).
    pub async fn getattr_path(&self, path: &str) -> Result<NodeInfo> {
        let mut current = ROOT_INODE;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.lookup(current, component).await?.inode;
        }
        self.getattr(current).await
    }

    pub async fn lookup(&self, parent: Inode, name: &str) -> Result<NodeInfo> {
        let listed = {
            let table = self.inner.table.lock().await;
            table.get(parent)?;
            table.listed.contains(&parent)
        };
        if !listed {
            self.readdir(parent).await?;
        }
        let table = self.inner.table.lock().await;
        let children = table
            .directories
            .get(&parent)
            .ok_or_else(Error::node_not_found)?;
        children
            .iter()
            .filter_map(|inode| table.nodes.get(inode))
            .find(|node| node.item.filename == name)
            .map(Self::info)
            .ok_or_else(Error::node_not_found)
    }

    pub async fn readdir(&self, inode: Inode) -> Result<Vec<NodeInfo>> {
        let (provider, item) = {
            let table = self.inner.table.lock().await;
            if inode == ROOT_INODE {
                let children = table.directories.get(&ROOT_INODE).cloned().unwrap_or_default();
                return Ok(children
                    .iter()
                    .filter_map(|i| table.nodes.get(i))
                    .map(Self::info)
                    .collect());
            }
            let node = table.get(inode)?;
            if !node.item.is_directory() {
                return Err(Error::invalid_argument("not a directory"));
            }
            (node.provider.clone(), node.item.clone())
        };

        let client = self.client(&provider)?;
        let items = self.run(client.list_directory(&item, discard)).await?;

        let mut table = self.inner.table.lock().await;
        let mut children: Vec<Inode> = items
            .into_iter()
            .map(|item| table.upsert(&provider, item))
            .collect();
        // Locally created files survive listing refills until their upload
        // resolves.
        children.extend(
            table
                .created
                .iter()
                .filter(|(_, created)| created.parent == inode)
                .map(|(&created_inode, _)| created_inode),
        );
        let infos = children
            .iter()
            .filter_map(|i| table.nodes.get(i))
            .map(Self::info)
            .collect();
        table.directories.insert(inode, children);
        table.listed.insert(inode);
        Ok(infos)
    }

    /// Reads from the local cache for created nodes, or issues a ranged
    /// download. Ranges beyond EOF clamp; fully-past-EOF reads return
    /// empty.
    pub async fn read(&self, inode: Inode, offset: u64, size: u32) -> Result<Vec<u8>> {
        let (provider, item, node_size) = {
            let mut table = self.inner.table.lock().await;
            if let Some(created) = table.created.get_mut(&inode) {
                return created.read_at(offset, size as usize).await;
            }
            let node = table.get(inode)?;
            (node.provider.clone(), node.item.clone(), node.size)
        };
        if offset >= node_size || size == 0 {
            return Ok(Vec::new());
        }
        let range = Range::new(offset, u64::from(size)).clamp_to(node_size);
        let client = self.client(&provider)?;
        self.run(client.download_bytes(&item, range, discard)).await
    }

    /// Writes are only legal on created (not yet uploaded) nodes.
    pub async fn write(&self, inode: Inode, offset: u64, data: &[u8]) -> Result<u32> {
        let mut table = self.inner.table.lock().await;
        if !table.created.contains_key(&inode) {
            return Err(Error::invalid_argument(
                "random-access writes to uploaded files are not supported",
            ));
        }
        let created = table.created.get_mut(&inode).expect("checked above");
        created.write_at(offset, data).await?;
        let end = offset + data.len() as u64;
        let node = table.get_mut(inode)?;
        node.size = node.size.max(end);
        Ok(data.len() as u32)
    }

    /// Creates a local-only file node backed by a temp cache file.
    pub async fn mknod(&self, parent: Inode, name: &str) -> Result<Inode> {
        let name = sanitize(name)?;
        let mut table = self.inner.table.lock().await;
        let parent_node = table.get(parent)?;
        if parent == ROOT_INODE {
            return Err(Error::invalid_argument("cannot create files at the root"));
        }
        if !parent_node.item.is_directory() {
            return Err(Error::invalid_argument("parent is not a directory"));
        }
        let provider = parent_node.provider.clone();
        let inode = table.allocate();
        let cache_path = self
            .inner
            .temporary_directory
            .join(format!("{inode}.tmp"));
        if let Some(dir) = cache_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = tokio::fs::File::create(&cache_path).await?;
        table.nodes.insert(
            inode,
            crate::node::Node {
                inode,
                provider,
                item: Item::new("", &name, FileType::Unknown),
                size: 0,
                upload_request: None,
            },
        );
        table.created.insert(
            inode,
            CreatedNode {
                parent,
                filename: name,
                cache_path,
                file,
            },
        );
        table
            .directories
            .entry(parent)
            .or_default()
            .push(inode);
        Ok(inode)
    }

    pub async fn mkdir(&self, parent: Inode, name: &str) -> Result<NodeInfo> {
        let name = sanitize(name)?;
        let (provider, parent_item) = {
            let table = self.inner.table.lock().await;
            let node = table.get(parent)?;
            (node.provider.clone(), node.item.clone())
        };
        let client = self.client(&provider)?;
        let item = self
            .run(client.create_directory(&parent_item, &name, discard))
            .await?;
        let mut table = self.inner.table.lock().await;
        let inode = table.upsert(&provider, item);
        table.directories.entry(parent).or_default().push(inode);
        table.get(inode).map(Self::info)
    }

    pub async fn remove(&self, parent: Inode, name: &str) -> Result<()> {
        let target = self.lookup(parent, name).await?;
        let mut table = self.inner.table.lock().await;
        if let Some(created) = table.created.remove(&target.inode) {
            drop(created.file);
            let _ = tokio::fs::remove_file(&created.cache_path).await;
            table.evict(target.inode);
            return Ok(());
        }
        let (provider, item) = {
            let node = table.get(target.inode)?;
            (node.provider.clone(), node.item.clone())
        };
        drop(table);
        let client = self.client(&provider)?;
        self.run(client.delete_item(&item, discard)).await?;
        self.inner.table.lock().await.evict(target.inode);
        Ok(())
    }

    /// Same-parent renames delegate to `rename_item`; cross-parent moves
    /// run `move_item` and then `rename_item` if the leaf name changed.
    /// Cross-provider renames are invalid.
    pub async fn rename(
        &self,
        parent: Inode,
        name: &str,
        new_parent: Inode,
        new_name: &str,
    ) -> Result<()> {
        let new_name = sanitize(new_name)?;
        let source = self.lookup(parent, name).await?;
        let (provider, item, target_provider, target_item) = {
            let table = self.inner.table.lock().await;
            let node = table.get(source.inode)?;
            let target = table.get(new_parent)?;
            (
                node.provider.clone(),
                node.item.clone(),
                target.provider.clone(),
                target.item.clone(),
            )
        };
        if provider != target_provider {
            return Err(Error::invalid_argument(
                "rename across providers is not supported",
            ));
        }
        let client = self.client(&provider)?;

        let updated = if parent == new_parent {
            if name == new_name {
                return Ok(());
            }
            self.run(client.rename_item(&item, &new_name, discard)).await?
        } else {
            let moved = self.run(client.move_item(&item, &target_item, discard)).await?;
            if moved.filename != new_name {
                self.run(client.rename_item(&moved, &new_name, discard)).await?
            } else {
                moved
            }
        };

        let mut table = self.inner.table.lock().await;
        table.evict(source.inode);
        let inode = table.upsert(&provider, updated);
        table.directories.entry(new_parent).or_default().push(inode);
        Ok(())
    }

    /// On a created node, launches the upload and returns immediately; the
    /// upload request is stored on the node so unmount cancels it, and the
    /// cache file is deleted only once the upload delivers (either way).
    pub async fn release(&self, inode: Inode) -> Result<()> {
        let (created, provider, parent_item) = {
            let mut table = self.inner.table.lock().await;
            let Some(created) = table.created.remove(&inode) else {
                return Ok(()); // release on a plain node is a no-op
            };
            let parent = table.get(created.parent)?;
            (created, parent.provider.clone(), parent.item.clone())
        };
        let CreatedNode {
            filename,
            cache_path,
            file,
            ..
        } = created;
        drop(file); // flush before the upload reader opens it

        let client = self.client(&provider)?;
        let source = Arc::new(FileSource::open(&cache_path).await?);
        let request = client.upload_file(&parent_item, &filename, source, None, discard);

        {
            let mut table = self.inner.table.lock().await;
            if let Ok(node) = table.get_mut(inode) {
                node.upload_request = Some(Arc::new(request.clone()));
            }
        }
        self.inner.track(Arc::new(request.clone()));

        // Watcher: fold the uploaded item back into the table and drop the
        // cache file after the terminal delivery.
        let inner = self.inner.clone();
        let watch_provider = provider.clone();
        tokio::spawn(async move {
            let outcome = request.result().await;
            let mut table = inner.table.lock().await;
            match outcome {
                Ok(item) => {
                    if let Ok(node) = table.get_mut(inode) {
                        let size = item.size.unwrap_or(node.size);
                        node.size = size;
                        node.item = item.clone();
                        node.upload_request = None;
                        table
                            .ids
                            .insert((watch_provider, item.id), inode);
                    }
                }
                Err(e) => {
                    if !e.is_aborted() {
                        warn!(code = e.code, "upload failed, dropping created node");
                    }
                    table.evict(inode);
                }
            }
            drop(table);
            let _ = tokio::fs::remove_file(&cache_path).await;
        });
        Ok(())
    }
}
