//! An inode-keyed cache over one or more cloud providers, backing a
//! POSIX-style interface: `lookup`, `getattr`, `read`, `write`, `readdir`,
//! `mknod`, `rename`, `release`. Files created locally live in a temp
//! cache until `release` uploads them.

mod filesystem;
mod node;
mod sanitize;

pub use filesystem::{FileSystem, NodeInfo};
pub use node::{FileSource, Inode, ROOT_INODE};
pub use sanitize::sanitize;
