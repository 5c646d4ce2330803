use crate::layout::BLOCK_SIZE;
use std::io;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error on block {block}: {source}")]
    Io {
        block: u32,
        #[source]
        source: io::Error,
    },
    #[error("short transfer on block {block}: {transferred} of {} bytes", BLOCK_SIZE)]
    ShortTransfer { block: u32, transferred: usize },
    #[error("device error: {0}")]
    Device(#[from] io::Error),
    #[error("no free inode slot")]
    NoFreeInode,
    #[error("no free data block")]
    NoFreeBlock,
    #[error("key not found")]
    NotFound,
    #[error("inode {0} is not allocated")]
    InodeNotLive(u32),
    #[error("key already holds different content")]
    KeyExists,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("inode {0} out of range")]
    InodeOutOfRange(u32),
    #[error("block {0} out of range")]
    BlockOutOfRange(u32),
    #[error("bad superblock magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
}

impl FsError {
    // 块读写失败，当前操作直接失败，不重试
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            FsError::Io { .. } | FsError::ShortTransfer { .. } | FsError::Device(_)
        )
    }

    // 分配器耗尽，调用者应认为存储已满
    pub fn is_exhausted(&self) -> bool {
        matches!(self, FsError::NoFreeInode | FsError::NoFreeBlock)
    }

    pub fn is_lookup_miss(&self) -> bool {
        matches!(self, FsError::NotFound | FsError::InodeNotLive(_))
    }
}
