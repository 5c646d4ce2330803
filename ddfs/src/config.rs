// 默认缓存的块数量
pub const DEFAULT_CACHE_BLOCKS: usize = 128;

// 格式化参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    // 为空时inode数量等于块数量
    pub inode_count: Option<u32>,
    pub uid: u32,
    pub volume_name: String,
    // 为每个元数据块预留一个inode
    pub reserve_metadata_inodes: bool,
    // 格式化前清零超级块、两个bitmap区和inode区
    pub erase_metadata: bool,
    pub cache_blocks: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            inode_count: None,
            uid: 0,
            volume_name: String::new(),
            reserve_metadata_inodes: false,
            erase_metadata: true,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
        }
    }
}

impl FormatOptions {
    pub fn with_inode_count(mut self, inode_count: u32) -> Self {
        self.inode_count = Some(inode_count);
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_volume_name(mut self, name: &str) -> Self {
        self.volume_name = String::from(name);
        self
    }

    pub fn with_reserved_metadata_inodes(mut self, reserve: bool) -> Self {
        self.reserve_metadata_inodes = reserve;
        self
    }

    pub fn with_erase_metadata(mut self, erase: bool) -> Self {
        self.erase_metadata = erase;
        self
    }

    pub fn with_cache_blocks(mut self, blocks: usize) -> Self {
        self.cache_blocks = blocks;
        self
    }

    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            cache_blocks: self.cache_blocks,
        }
    }
}

// 打开已有文件系统的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    pub cache_blocks: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_blocks: DEFAULT_CACHE_BLOCKS,
        }
    }
}
