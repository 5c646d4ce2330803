extern crate alloc;

pub mod bitmap;
pub mod block_cache;
pub mod block_device;
pub mod config;
pub mod dedup_fs;
pub mod error;
pub mod hash;
pub mod inode;
pub mod inode_store;
pub mod key;
pub mod kv;
pub mod layout;
pub mod super_block;

pub use block_device::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use config::{FormatOptions, MountOptions};
pub use dedup_fs::{erase_disk, CheckReport, DedupFileSystem, FsStat};
pub use error::{FsError, Result};
pub use key::Key;
pub use kv::KvStore;
pub use layout::{Block, BLOCK_SIZE};
pub use super_block::SuperBlock;
