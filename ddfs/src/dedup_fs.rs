use crate::bitmap::Bitmap;
use crate::block_cache::BlockCache;
use crate::block_device::{write_block, BlockDevice};
use crate::config::{FormatOptions, MountOptions};
use crate::error::{FsError, Result};
use crate::layout::*;
use crate::super_block::{read_superblock, write_superblock, SuperBlock};
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, info};

// 文件系统的计数和布局信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub block_count: u32,
    pub data_block_count: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
    pub free_blocks: u32,
}

// 一致性检查的结果，只读不修复
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub live_inodes: u32,
    pub reserved_inodes: u32,
    pub allocated_blocks: u32,
    pub referenced_blocks: u32,
    pub problems: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

// DedupFileSystem 每个打开的设备一个，持有解析后的超级块
pub struct DedupFileSystem {
    pub(crate) cache: BlockCache,
    pub(crate) sb: SuperBlock,
    pub(crate) inode_bitmap: Bitmap,
    pub(crate) data_bitmap: Bitmap,
}

impl DedupFileSystem {
    // 在块设备上创建一个文件系统
    pub fn format(block_dev: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<Self> {
        let media_size = block_dev.media_size()?;
        let sb = SuperBlock::compute(media_size, options)?;
        let mut cache = BlockCache::new(block_dev, options.cache_blocks);
        if options.erase_metadata {
            erase_superblock(&mut cache)?;
            erase_ifree_blocks(&mut cache, &sb)?;
            erase_bfree_blocks(&mut cache, &sb)?;
            erase_inode_store(&mut cache, &sb)?;
        }
        // 写入超级块
        write_superblock(&mut cache, &sb)?;
        let mut fs = Self::from_superblock(cache, sb);
        fs.initialize_superblock_inode()?;
        if options.reserve_metadata_inodes {
            fs.initialize_ifree_inodes()?;
            fs.initialize_bfree_inodes()?;
            fs.initialize_istore_inodes()?;
        }
        info!(
            "ddfs formatted: {} blocks, {} inodes, {} data blocks starting at block {}",
            fs.sb.block_count,
            fs.sb.inode_count,
            fs.sb.data_block_count,
            fs.sb.data_start_block()
        );
        return Ok(fs);
    }

    // 从块设备上打开文件系统
    pub fn open(block_dev: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let mut cache = BlockCache::new(block_dev, options.cache_blocks);
        let sb = read_superblock(&mut cache)?;
        info!(
            "ddfs opened: {} blocks, {} free inodes, {} free blocks",
            sb.block_count, sb.ifree_count, sb.bfree_count
        );
        return Ok(Self::from_superblock(cache, sb));
    }

    fn from_superblock(cache: BlockCache, sb: SuperBlock) -> Self {
        // inode bitmap从块1开始，data bitmap紧跟其后；data bitmap的序号相对数据区起点
        let inode_bitmap = Bitmap::new(sb.ifree_start_block(), sb.ifree_block_count, sb.inode_count);
        let data_bitmap = Bitmap::new(
            sb.bfree_start_block(),
            sb.bfree_block_count,
            sb.data_block_count,
        );
        return Self {
            cache,
            sb,
            inode_bitmap,
            data_bitmap,
        };
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn stat(&self) -> FsStat {
        FsStat {
            block_count: self.sb.block_count,
            data_block_count: self.sb.data_block_count,
            inode_count: self.sb.inode_count,
            free_inodes: self.sb.ifree_count,
            free_blocks: self.sb.bfree_count,
        }
    }

    // 计数变化后写回块0
    pub fn sync_superblock(&mut self) -> Result<()> {
        write_superblock(&mut self.cache, &self.sb)
    }

    fn check_inode(&self, inode_number: u32) -> Result<()> {
        if inode_number >= self.sb.inode_count {
            return Err(FsError::InodeOutOfRange(inode_number));
        }
        Ok(())
    }

    fn data_index(&self, block_id: u32) -> Result<u32> {
        if !self.sb.is_data_block(block_id) {
            return Err(FsError::BlockOutOfRange(block_id));
        }
        Ok(block_id - self.sb.data_start_block())
    }

    pub fn get_inode_bit(&mut self, inode_number: u32) -> Result<bool> {
        self.check_inode(inode_number)?;
        self.inode_bitmap.get(&mut self.cache, inode_number)
    }

    pub fn set_inode_bit(&mut self, inode_number: u32) -> Result<()> {
        self.check_inode(inode_number)?;
        self.inode_bitmap.set(&mut self.cache, inode_number)
    }

    pub fn clear_inode_bit(&mut self, inode_number: u32) -> Result<()> {
        self.check_inode(inode_number)?;
        self.inode_bitmap.clear(&mut self.cache, inode_number)
    }

    // 数据块bitmap按绝对块号访问
    pub fn get_block_bit(&mut self, block_id: u32) -> Result<bool> {
        let idx = self.data_index(block_id)?;
        self.data_bitmap.get(&mut self.cache, idx)
    }

    pub fn set_block_bit(&mut self, block_id: u32) -> Result<()> {
        let idx = self.data_index(block_id)?;
        self.data_bitmap.set(&mut self.cache, idx)
    }

    pub fn clear_block_bit(&mut self, block_id: u32) -> Result<()> {
        let idx = self.data_index(block_id)?;
        self.data_bitmap.clear(&mut self.cache, idx)
    }

    pub fn get_next_free_inode(&mut self) -> Result<Option<u32>> {
        self.inode_bitmap.first_free(&mut self.cache)
    }

    // 返回第一个空闲数据块的绝对块号
    pub fn get_next_free_block(&mut self) -> Result<Option<u32>> {
        let start = self.sb.data_start_block();
        Ok(self
            .data_bitmap
            .first_free(&mut self.cache)?
            .map(|idx| start + idx))
    }

    pub fn read_data_block(&mut self, block_id: u32, out: &mut Block) -> Result<()> {
        self.data_index(block_id)?;
        self.cache.read_into(block_id, out)
    }

    pub fn write_data_block(&mut self, block_id: u32, data: &Block) -> Result<()> {
        self.data_index(block_id)?;
        self.cache.write(block_id, data)
    }

    // 标记数据块已分配，先写数据再置位
    pub fn allocate_block(&mut self, block_id: u32) -> Result<()> {
        if self.get_block_bit(block_id)? {
            return Ok(());
        }
        self.set_block_bit(block_id)?;
        self.sb.bfree_count = self.sb.bfree_count.saturating_sub(1);
        debug!("allocated data block {}", block_id);
        self.sync_superblock()
    }

    // 回收数据块：清零内容并清除bitmap位
    pub fn release_block(&mut self, block_id: u32) -> Result<()> {
        if !self.get_block_bit(block_id)? {
            return Ok(());
        }
        self.write_data_block(block_id, &[0u8; BLOCK_SIZE])?;
        self.clear_block_bit(block_id)?;
        self.sb.bfree_count = (self.sb.bfree_count + 1).min(self.sb.data_block_count);
        debug!("released data block {}", block_id);
        self.sync_superblock()
    }

    // 只读一致性检查：bitmap计数和超级块计数、inode的块指针
    pub fn check(&mut self) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let inode_bits = self.inode_bitmap.count_set(&mut self.cache)?;
        let block_bits = self.data_bitmap.count_set(&mut self.cache)?;
        report.allocated_blocks = block_bits;
        if inode_bits + self.sb.ifree_count != self.sb.inode_count {
            report.problems.push(format!(
                "inode bitmap has {} bits set but superblock reports {} free of {}",
                inode_bits, self.sb.ifree_count, self.sb.inode_count
            ));
        }
        if block_bits + self.sb.bfree_count != self.sb.data_block_count {
            report.problems.push(format!(
                "block bitmap has {} bits set but superblock reports {} free of {}",
                block_bits, self.sb.bfree_count, self.sb.data_block_count
            ));
        }
        if !self.get_inode_bit(SENTINEL_INODE)? {
            report.problems.push(String::from("sentinel inode 0 is not allocated"));
        }

        let mut referenced = BTreeSet::new();
        let mut bad_pointers = Vec::new();
        self.scan_live_inodes(|inode| {
            if inode.is_reserved() {
                report.reserved_inodes += 1;
            } else {
                report.live_inodes += 1;
                referenced.insert(inode.block_ptr);
                if inode.ref_count == 0 {
                    bad_pointers.push(format!("inode {} is live with reference count 0", inode.number));
                }
            }
            true
        })?;
        for block_id in referenced.iter() {
            if !self.sb.is_data_block(*block_id) {
                bad_pointers.push(format!("block pointer {} is outside the data region", block_id));
            } else if !self.get_block_bit(*block_id)? {
                bad_pointers.push(format!("referenced block {} is marked free", block_id));
            }
        }
        report.referenced_blocks = referenced.len() as u32;
        report.problems.extend(bad_pointers);
        if block_bits > report.referenced_blocks {
            report.problems.push(format!(
                "{} allocated blocks are not referenced by any inode",
                block_bits - report.referenced_blocks
            ));
        }
        return Ok(report);
    }
}

pub fn erase_superblock(cache: &mut BlockCache) -> Result<()> {
    cache.write(0, &[0u8; BLOCK_SIZE])
}

// 清空inode bitmap块
pub fn erase_ifree_blocks(cache: &mut BlockCache, sb: &SuperBlock) -> Result<()> {
    erase_range(cache, sb.ifree_start_block(), sb.bfree_start_block())
}

// 清空data bitmap块
pub fn erase_bfree_blocks(cache: &mut BlockCache, sb: &SuperBlock) -> Result<()> {
    erase_range(cache, sb.bfree_start_block(), sb.istore_start_block())
}

pub fn erase_inode_store(cache: &mut BlockCache, sb: &SuperBlock) -> Result<()> {
    erase_range(cache, sb.istore_start_block(), sb.data_start_block())
}

fn erase_range(cache: &mut BlockCache, start: u32, end: u32) -> Result<()> {
    let zero = [0u8; BLOCK_SIZE];
    for block_id in start..end {
        cache.write(block_id, &zero)?;
    }
    Ok(())
}

// 清零整个设备，格式化工具使用
pub fn erase_disk(block_dev: &dyn BlockDevice) -> Result<()> {
    let media_size = block_dev.media_size()?;
    let block_count = div_ceil(media_size, BLOCK_SIZE as u64);
    let zero = [0u8; BLOCK_SIZE];
    for block_id in 0..block_count.min(u32::MAX as u64) as u32 {
        write_block(block_dev, block_id, &zero)?;
    }
    Ok(())
}

#[cfg(test)]
mod dedup_fs_tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;

    fn format(blocks: u32, options: &FormatOptions) -> DedupFileSystem {
        DedupFileSystem::format(Arc::new(MemoryBlockDevice::new(blocks)), options).unwrap()
    }

    #[test]
    fn test_format_reserves_sentinel() {
        let mut fs = format(1024, &FormatOptions::default());
        assert!(fs.get_inode_bit(SENTINEL_INODE).unwrap());
        assert_eq!(fs.get_next_free_inode().unwrap(), Some(1));
        let stat = fs.stat();
        assert_eq!(stat.free_inodes, 1023);
        assert_eq!(stat.free_blocks, stat.data_block_count);
        assert!(fs.check().unwrap().is_clean());
    }

    #[test]
    fn test_open_after_format() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(256));
        let options = FormatOptions::default().with_volume_name("vol0");
        let formatted = DedupFileSystem::format(Arc::clone(&dev), &options).unwrap();
        let opened = DedupFileSystem::open(dev, &MountOptions::default()).unwrap();
        assert_eq!(opened.superblock(), formatted.superblock());
        assert_eq!(opened.superblock().volume_name(), "vol0");
    }

    #[test]
    fn test_open_unformatted_device() {
        let dev = Arc::new(MemoryBlockDevice::new(64));
        match DedupFileSystem::open(dev, &MountOptions::default()) {
            Err(FsError::BadMagic(_)) => {}
            other => panic!("expect bad magic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bitmaps_live_in_separate_regions() {
        let mut fs = format(1024, &FormatOptions::default());
        let data_start = fs.sb.data_start_block();
        fs.set_block_bit(data_start + 5).unwrap();
        assert!(fs.get_block_bit(data_start + 5).unwrap());
        assert!(!fs.get_inode_bit(5).unwrap());
        // inode位在块1，数据块位在块2
        let inode_byte = fs.cache.read(1, |data| data[0]).unwrap();
        let block_byte = fs.cache.read(2, |data| data[0]).unwrap();
        assert_eq!(inode_byte, 0b1);
        assert_eq!(block_byte, 0b10_0000);
    }

    #[test]
    fn test_block_bits_reject_metadata_blocks() {
        let mut fs = format(1024, &FormatOptions::default());
        assert!(matches!(fs.get_block_bit(3), Err(FsError::BlockOutOfRange(3))));
        assert!(matches!(fs.get_block_bit(1024), Err(FsError::BlockOutOfRange(1024))));
        assert!(matches!(fs.get_inode_bit(1024), Err(FsError::InodeOutOfRange(1024))));
    }

    #[test]
    fn test_allocate_and_release_block() {
        let mut fs = format(128, &FormatOptions::default());
        let before = fs.stat().free_blocks;
        let block = fs.get_next_free_block().unwrap().unwrap();
        assert_eq!(block, fs.sb.data_start_block());
        fs.write_data_block(block, &[9u8; BLOCK_SIZE]).unwrap();
        fs.allocate_block(block).unwrap();
        assert_eq!(fs.stat().free_blocks, before - 1);
        assert_eq!(fs.get_next_free_block().unwrap(), Some(block + 1));
        // 重复分配不改变计数
        fs.allocate_block(block).unwrap();
        assert_eq!(fs.stat().free_blocks, before - 1);
        fs.release_block(block).unwrap();
        assert_eq!(fs.stat().free_blocks, before);
        let mut out = [1u8; BLOCK_SIZE];
        fs.read_data_block(block, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_reformat_clears_metadata() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(128));
        let mut fs = DedupFileSystem::format(Arc::clone(&dev), &FormatOptions::default()).unwrap();
        fs.set_inode_bit(9).unwrap();
        let mut again = DedupFileSystem::format(dev, &FormatOptions::default()).unwrap();
        assert!(!again.get_inode_bit(9).unwrap());
        assert!(again.check().unwrap().is_clean());
    }

    #[test]
    fn test_erase_disk() {
        let dev = MemoryBlockDevice::new(8);
        write_block(&dev, 7, &[3u8; BLOCK_SIZE]).unwrap();
        erase_disk(&dev).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        crate::block_device::read_block(&dev, 7, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_check_detects_counter_drift() {
        let mut fs = format(256, &FormatOptions::default());
        fs.sb.bfree_count -= 1;
        let report = fs.check().unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.problems.len(), 1);
    }
}
