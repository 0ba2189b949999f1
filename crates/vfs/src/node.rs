use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_core::http::UploadSource;
use nimbus_core::{AbstractRequest, Error, Item, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub type Inode = u64;

/// Inode 1 is the synthetic root that lists one directory per provider.
pub const ROOT_INODE: Inode = 1;

/// A resident VFS node. Identity is the inode; `item.id` is additionally
/// indexed so provider-originated references resolve to the same node.
pub struct Node {
    pub inode: Inode,
    pub provider: String,
    pub item: Item,
    pub size: u64,
    /// Set by `release` on created nodes so unmount can cancel in-flight
    /// uploads.
    pub upload_request: Option<Arc<dyn AbstractRequest>>,
}

/// A file that exists only locally, between `mknod` and the completion of
/// the upload triggered by `release`. Writes go to the cache file; `size`
/// on the owning [`Node`] is updated eagerly.
pub struct CreatedNode {
    pub parent: Inode,
    pub filename: String,
    pub cache_path: PathBuf,
    pub file: tokio::fs::File,
}

impl CreatedNode {
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    pub async fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }
}

/// All inode-keyed state, guarded by one async mutex in the file system.
#[derive(Default)]
pub struct NodeTable {
    pub nodes: HashMap<Inode, Node>,
    /// `(provider, external id) -> inode`; bijective with resident nodes.
    pub ids: HashMap<(String, String), Inode>,
    /// Children of listed directories.
    pub directories: HashMap<Inode, Vec<Inode>>,
    pub listed: HashSet<Inode>,
    pub created: HashMap<Inode, CreatedNode>,
    /// Per-provider pseudo-directories under the root.
    pub auth_nodes: HashMap<String, Inode>,
    pub next_inode: Inode,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            next_inode: ROOT_INODE + 1,
            ..Default::default()
        }
    }

    pub fn allocate(&mut self) -> Inode {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    pub fn get(&self, inode: Inode) -> Result<&Node> {
        self.nodes.get(&inode).ok_or_else(Error::node_not_found)
    }

    pub fn get_mut(&mut self, inode: Inode) -> Result<&mut Node> {
        self.nodes.get_mut(&inode).ok_or_else(Error::node_not_found)
    }

    /// Inserts or refreshes the node for `item`, keeping the id index
    /// bijective: an item already resident updates in place.
    pub fn upsert(&mut self, provider: &str, item: Item) -> Inode {
        let key = (provider.to_string(), item.id.clone());
        if let Some(&inode) = self.ids.get(&key) {
            if let Some(node) = self.nodes.get_mut(&inode) {
                node.size = item.size.unwrap_or(node.size);
                node.item = item;
            }
            return inode;
        }
        let inode = self.allocate();
        let size = item.size.unwrap_or(0);
        self.nodes.insert(
            inode,
            Node {
                inode,
                provider: provider.to_string(),
                item,
                size,
                upload_request: None,
            },
        );
        let (provider, id) = key;
        self.ids.insert((provider, id), inode);
        inode
    }

    /// Drops a node and its index entries. Called only when nothing holds
    /// the inode anymore.
    pub fn evict(&mut self, inode: Inode) {
        if let Some(node) = self.nodes.remove(&inode) {
            self.ids.remove(&(node.provider, node.item.id));
        }
        self.listed.remove(&inode);
        self.directories.remove(&inode);
        for children in self.directories.values_mut() {
            children.retain(|&c| c != inode);
        }
    }
}

/// Random-access reader over an upload cache file; handed to providers as
/// the upload body so release-time uploads stream from disk.
pub struct FileSource {
    file: Mutex<tokio::fs::File>,
    size: u64,
}

impl FileSource {
    pub async fn open(path: &PathBuf) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

#[async_trait]
impl UploadSource for FileSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let len = len.min((self.size - offset) as usize);
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(Bytes::from(buffer))
    }
}
