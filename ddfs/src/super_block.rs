use crate::block_cache::BlockCache;
use crate::config::FormatOptions;
use crate::error::{FsError, Result};
use crate::layout::*;
use byteorder::{ByteOrder, LittleEndian};

// 超级块字段在块0中的偏移，全部小端序
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_MEDIA_SIZE: usize = 8;
const OFF_BLOCK_SIZE: usize = 16;
const OFF_BLOCK_COUNT: usize = 20;
const OFF_IFREE_BLOCKS: usize = 24;
const OFF_BFREE_BLOCKS: usize = 28;
const OFF_ISTORE_BLOCKS: usize = 32;
const OFF_DATA_BLOCKS: usize = 36;
const OFF_INODE_SIZE: usize = 40;
const OFF_INODE_COUNT: usize = 44;
const OFF_IFREE_COUNT: usize = 48;
const OFF_BFREE_COUNT: usize = 52;
const OFF_ISTORE_OFFSET: usize = 56;
const OFF_DATA_OFFSET: usize = 60;
const OFF_UID: usize = 64;
const OFF_NAME: usize = 68;
const OFF_VOLUME_NAME: usize = OFF_NAME + NAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic_number: u32,
    pub version: u32,
    pub media_size: u64,
    pub block_size: u32,
    pub block_count: u32,
    pub ifree_block_count: u32,  // inode bitmap块数量
    pub bfree_block_count: u32,  // data bitmap块数量
    pub istore_block_count: u32, // inode块总数
    pub data_block_count: u32,   // 数据块总数
    pub inode_size: u32,
    pub inode_count: u32,
    pub ifree_count: u32, // 空闲inode数量
    pub bfree_count: u32, // 空闲数据块数量
    pub istore_offset: u32,
    pub data_offset: u32,
    pub uid: u32,
    pub name: [u8; NAME_LEN],
    pub volume_name: [u8; NAME_LEN],
}

impl SuperBlock {
    // 根据介质大小计算文件系统的布局
    pub fn compute(media_size: u64, options: &FormatOptions) -> Result<Self> {
        let block_count = media_size / BLOCK_SIZE as u64;
        if block_count > u32::MAX as u64 {
            return Err(FsError::InvalidGeometry(format!(
                "{} blocks exceed the 32-bit block count",
                block_count
            )));
        }
        let inode_count = options.inode_count.map(u64::from).unwrap_or(block_count);
        if inode_count < 2 {
            return Err(FsError::InvalidGeometry(format!(
                "{} inodes leave no slot beside the sentinel",
                inode_count
            )));
        }
        let ifree_block_count = div_ceil(inode_count, BITS_PER_BLOCK);
        let bfree_block_count = div_ceil(block_count, BITS_PER_BLOCK);
        let istore_block_count = div_ceil(inode_count, INODES_PER_BLOCK as u64);
        let metadata_blocks = 1 + ifree_block_count + bfree_block_count + istore_block_count;
        if block_count <= metadata_blocks {
            return Err(FsError::InvalidGeometry(format!(
                "{} blocks cannot hold {} metadata blocks and any data",
                block_count, metadata_blocks
            )));
        }
        let data_block_count = block_count - metadata_blocks;
        let istore_offset = BLOCK_SIZE as u64 * (1 + ifree_block_count + bfree_block_count);
        let data_offset = istore_offset + istore_block_count * BLOCK_SIZE as u64;
        if data_offset > u32::MAX as u64 {
            return Err(FsError::InvalidGeometry(format!(
                "data offset {} does not fit in 32 bits",
                data_offset
            )));
        }
        let mut name = [0u8; NAME_LEN];
        name[..DDFS_NAME.len()].copy_from_slice(DDFS_NAME.as_bytes());
        let mut volume_name = [0u8; NAME_LEN];
        let label = options.volume_name.as_bytes();
        let label_len = label.len().min(NAME_LEN);
        volume_name[..label_len].copy_from_slice(&label[..label_len]);
        return Ok(Self {
            magic_number: DDFS_MAGIC,
            version: DDFS_VERSION,
            media_size,
            block_size: BLOCK_SIZE as u32,
            block_count: block_count as u32,
            ifree_block_count: ifree_block_count as u32,
            bfree_block_count: bfree_block_count as u32,
            istore_block_count: istore_block_count as u32,
            data_block_count: data_block_count as u32,
            inode_size: INODE_SIZE as u32,
            inode_count: inode_count as u32,
            // inode 0 被保留
            ifree_count: inode_count as u32 - 1,
            bfree_count: data_block_count as u32,
            istore_offset: istore_offset as u32,
            data_offset: data_offset as u32,
            uid: options.uid,
            name,
            volume_name,
        });
    }

    // 验证文件系统
    pub fn verify(&self) -> bool {
        return self.magic_number == DDFS_MAGIC;
    }

    pub fn encode(&self, block: &mut Block) {
        block.fill(0);
        LittleEndian::write_u32(&mut block[OFF_MAGIC..], self.magic_number);
        LittleEndian::write_u32(&mut block[OFF_VERSION..], self.version);
        LittleEndian::write_u64(&mut block[OFF_MEDIA_SIZE..], self.media_size);
        LittleEndian::write_u32(&mut block[OFF_BLOCK_SIZE..], self.block_size);
        LittleEndian::write_u32(&mut block[OFF_BLOCK_COUNT..], self.block_count);
        LittleEndian::write_u32(&mut block[OFF_IFREE_BLOCKS..], self.ifree_block_count);
        LittleEndian::write_u32(&mut block[OFF_BFREE_BLOCKS..], self.bfree_block_count);
        LittleEndian::write_u32(&mut block[OFF_ISTORE_BLOCKS..], self.istore_block_count);
        LittleEndian::write_u32(&mut block[OFF_DATA_BLOCKS..], self.data_block_count);
        LittleEndian::write_u32(&mut block[OFF_INODE_SIZE..], self.inode_size);
        LittleEndian::write_u32(&mut block[OFF_INODE_COUNT..], self.inode_count);
        LittleEndian::write_u32(&mut block[OFF_IFREE_COUNT..], self.ifree_count);
        LittleEndian::write_u32(&mut block[OFF_BFREE_COUNT..], self.bfree_count);
        LittleEndian::write_u32(&mut block[OFF_ISTORE_OFFSET..], self.istore_offset);
        LittleEndian::write_u32(&mut block[OFF_DATA_OFFSET..], self.data_offset);
        LittleEndian::write_u32(&mut block[OFF_UID..], self.uid);
        block[OFF_NAME..OFF_NAME + NAME_LEN].copy_from_slice(&self.name);
        block[OFF_VOLUME_NAME..OFF_VOLUME_NAME + NAME_LEN].copy_from_slice(&self.volume_name);
    }

    pub fn decode(block: &Block) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&block[OFF_NAME..OFF_NAME + NAME_LEN]);
        let mut volume_name = [0u8; NAME_LEN];
        volume_name.copy_from_slice(&block[OFF_VOLUME_NAME..OFF_VOLUME_NAME + NAME_LEN]);
        Self {
            magic_number: LittleEndian::read_u32(&block[OFF_MAGIC..]),
            version: LittleEndian::read_u32(&block[OFF_VERSION..]),
            media_size: LittleEndian::read_u64(&block[OFF_MEDIA_SIZE..]),
            block_size: LittleEndian::read_u32(&block[OFF_BLOCK_SIZE..]),
            block_count: LittleEndian::read_u32(&block[OFF_BLOCK_COUNT..]),
            ifree_block_count: LittleEndian::read_u32(&block[OFF_IFREE_BLOCKS..]),
            bfree_block_count: LittleEndian::read_u32(&block[OFF_BFREE_BLOCKS..]),
            istore_block_count: LittleEndian::read_u32(&block[OFF_ISTORE_BLOCKS..]),
            data_block_count: LittleEndian::read_u32(&block[OFF_DATA_BLOCKS..]),
            inode_size: LittleEndian::read_u32(&block[OFF_INODE_SIZE..]),
            inode_count: LittleEndian::read_u32(&block[OFF_INODE_COUNT..]),
            ifree_count: LittleEndian::read_u32(&block[OFF_IFREE_COUNT..]),
            bfree_count: LittleEndian::read_u32(&block[OFF_BFREE_COUNT..]),
            istore_offset: LittleEndian::read_u32(&block[OFF_ISTORE_OFFSET..]),
            data_offset: LittleEndian::read_u32(&block[OFF_DATA_OFFSET..]),
            uid: LittleEndian::read_u32(&block[OFF_UID..]),
            name,
            volume_name,
        }
    }

    // 检查磁盘上的布局是否自洽，不自洽时拒绝挂载
    pub fn validate(&self) -> Result<()> {
        if !self.verify() {
            return Err(FsError::BadMagic(self.magic_number));
        }
        if self.version > DDFS_VERSION {
            return Err(FsError::UnsupportedVersion(self.version));
        }
        if self.block_size as usize != BLOCK_SIZE || self.inode_size as usize != INODE_SIZE {
            return Err(FsError::InvalidGeometry(format!(
                "block size {} / inode size {}",
                self.block_size, self.inode_size
            )));
        }
        let regions = 1u64
            + self.ifree_block_count as u64
            + self.bfree_block_count as u64
            + self.istore_block_count as u64
            + self.data_block_count as u64;
        let aligned = self.istore_offset as usize % BLOCK_SIZE == 0
            && self.data_offset as usize % BLOCK_SIZE == 0;
        if regions != self.block_count as u64
            || !aligned
            || self.istore_start_block() != 1 + self.ifree_block_count + self.bfree_block_count
            || self.data_start_block() != self.istore_start_block() + self.istore_block_count
            || (self.ifree_block_count as u64) * BITS_PER_BLOCK < self.inode_count as u64
            || (self.istore_block_count as u64) * (INODES_PER_BLOCK as u64) < self.inode_count as u64
        {
            return Err(FsError::InvalidGeometry(String::from(
                "superblock regions are inconsistent",
            )));
        }
        Ok(())
    }

    pub fn ifree_start_block(&self) -> u32 {
        1
    }

    pub fn bfree_start_block(&self) -> u32 {
        1 + self.ifree_block_count
    }

    pub fn istore_start_block(&self) -> u32 {
        self.istore_offset / BLOCK_SIZE as u32
    }

    pub fn data_start_block(&self) -> u32 {
        self.data_offset / BLOCK_SIZE as u32
    }

    pub fn is_data_block(&self, block_id: u32) -> bool {
        block_id >= self.data_start_block()
            && ((block_id - self.data_start_block()) as u64) < self.data_block_count as u64
    }

    pub fn name(&self) -> &str {
        trimmed(&self.name)
    }

    pub fn volume_name(&self) -> &str {
        trimmed(&self.volume_name)
    }
}

fn trimmed(raw: &[u8; NAME_LEN]) -> &str {
    let length = raw.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    core::str::from_utf8(&raw[..length]).unwrap_or("")
}

pub fn read_superblock(cache: &mut BlockCache) -> Result<SuperBlock> {
    let sb = cache.read(0, SuperBlock::decode)?;
    sb.validate()?;
    Ok(sb)
}

pub fn write_superblock(cache: &mut BlockCache, sb: &SuperBlock) -> Result<()> {
    let mut block = [0u8; BLOCK_SIZE];
    sb.encode(&mut block);
    cache.write(0, &block)
}
