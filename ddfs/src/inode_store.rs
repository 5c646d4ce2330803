use crate::dedup_fs::DedupFileSystem;
use crate::error::{FsError, Result};
use crate::inode::DiskInode;
use crate::layout::*;
use log::{debug, warn};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// inode 区的读写、引用计数和元数据inode的初始化
impl DedupFileSystem {
    // inode在inode区中的 (块号, 块内偏移)
    pub fn inode_position(&self, inode_number: u32) -> Result<(u32, usize)> {
        if inode_number >= self.sb.inode_count {
            return Err(FsError::InodeOutOfRange(inode_number));
        }
        let block = self.sb.istore_start_block() + inode_number / INODES_PER_BLOCK as u32;
        let offset = (inode_number as usize * INODE_SIZE) % BLOCK_SIZE;
        return Ok((block, offset));
    }

    // 不检查bitmap，直接读出槽位内容
    pub(crate) fn read_inode_raw(&mut self, inode_number: u32) -> Result<DiskInode> {
        let (block, offset) = self.inode_position(inode_number)?;
        self.cache
            .read(block, |data| DiskInode::decode(&data[offset..offset + INODE_SIZE]))
    }

    pub fn write_inode(&mut self, inode_number: u32, inode: &DiskInode) -> Result<()> {
        let (block, offset) = self.inode_position(inode_number)?;
        self.cache
            .modify(block, |data| inode.encode(&mut data[offset..offset + INODE_SIZE]))
    }

    // 读取一个已分配的inode
    pub fn get_inode(&mut self, inode_number: u32) -> Result<DiskInode> {
        if !self.get_inode_bit(inode_number)? {
            return Err(FsError::InodeNotLive(inode_number));
        }
        self.read_inode_raw(inode_number)
    }

    // 把记录写入槽位并标记已分配，槽位原本空闲时扣减空闲计数
    pub(crate) fn install_inode(&mut self, inode_number: u32, mut inode: DiskInode) -> Result<DiskInode> {
        inode.number = inode_number;
        self.write_inode(inode_number, &inode)?;
        if !self.get_inode_bit(inode_number)? {
            self.set_inode_bit(inode_number)?;
            self.sb.ifree_count = self.sb.ifree_count.saturating_sub(1);
            self.sync_superblock()?;
        }
        return Ok(inode);
    }

    pub fn initialize_inode(
        &mut self,
        inode_number: u32,
        key: &[u8; KEY_SIZE],
        block_ptr: u32,
    ) -> Result<DiskInode> {
        let uid = self.sb.uid;
        let inode = DiskInode::new(inode_number, uid, *key, block_ptr, now());
        debug!("initialize inode {} -> block {}", inode_number, block_ptr);
        self.install_inode(inode_number, inode)
    }

    // 清零槽位并清除bitmap位，返回原来的记录
    pub fn free_inode(&mut self, inode_number: u32) -> Result<DiskInode> {
        let old = self.read_inode_raw(inode_number)?;
        self.write_inode(inode_number, &DiskInode::default())?;
        if self.get_inode_bit(inode_number)? {
            self.clear_inode_bit(inode_number)?;
            self.sb.ifree_count = (self.sb.ifree_count + 1).min(self.sb.inode_count);
            self.sync_superblock()?;
        }
        debug!("freed inode {}", inode_number);
        return Ok(old);
    }

    pub fn get_reference_count(&mut self, inode_number: u32) -> Result<u16> {
        Ok(self.get_inode(inode_number)?.ref_count)
    }

    // 引用计数加一，达到u16上限后保持不变
    pub fn increment_reference_count(&mut self, inode_number: u32) -> Result<u16> {
        let mut inode = self.get_inode(inode_number)?;
        if inode.ref_count == u16::MAX {
            warn!("reference count of inode {} saturated", inode_number);
            return Ok(inode.ref_count);
        }
        inode.ref_count += 1;
        inode.mod_time = now();
        self.write_inode(inode_number, &inode)?;
        return Ok(inode.ref_count);
    }

    pub fn decrement_reference_count(&mut self, inode_number: u32) -> Result<u16> {
        let mut inode = self.get_inode(inode_number)?;
        inode.ref_count = inode.ref_count.saturating_sub(1);
        inode.mod_time = now();
        self.write_inode(inode_number, &inode)?;
        return Ok(inode.ref_count);
    }

    // 按槽位顺序遍历所有已分配的inode，f返回false时提前结束
    pub(crate) fn scan_live_inodes<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&DiskInode) -> bool,
    {
        let mut raw = [0u8; BLOCK_SIZE];
        for seq in 0..self.sb.istore_block_count {
            let first = seq * INODES_PER_BLOCK as u32;
            if first >= self.sb.inode_count {
                break;
            }
            self.cache.read_into(self.sb.istore_start_block() + seq, &mut raw)?;
            let last = (first + INODES_PER_BLOCK as u32).min(self.sb.inode_count);
            for inode_number in first..last {
                if !self.get_inode_bit(inode_number)? {
                    continue;
                }
                let offset = (inode_number - first) as usize * INODE_SIZE;
                let inode = DiskInode::decode(&raw[offset..offset + INODE_SIZE]);
                if !f(&inode) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // 是否还有非保留的inode指向这个数据块
    pub fn block_is_referenced(&mut self, block_ptr: u32) -> Result<bool> {
        let mut found = false;
        self.scan_live_inodes(|inode| {
            found = !inode.is_reserved() && inode.block_ptr == block_ptr;
            !found
        })?;
        return Ok(found);
    }

    // inode 0 是superblock inode，同时作为哨兵，永远不分配给用户key
    pub fn initialize_superblock_inode(&mut self) -> Result<()> {
        self.clear_inode_bit(SENTINEL_INODE)?;
        let inode = DiskInode::reserved(SENTINEL_INODE, self.sb.uid, 0, now());
        self.write_inode(SENTINEL_INODE, &inode)?;
        self.set_inode_bit(SENTINEL_INODE)
    }

    pub fn initialize_ifree_inodes(&mut self) -> Result<()> {
        let start = self.sb.ifree_start_block();
        self.reserve_metadata_range(start, self.sb.ifree_block_count)
    }

    pub fn initialize_bfree_inodes(&mut self) -> Result<()> {
        let start = self.sb.bfree_start_block();
        self.reserve_metadata_range(start, self.sb.bfree_block_count)
    }

    pub fn initialize_istore_inodes(&mut self) -> Result<()> {
        let start = self.sb.istore_start_block();
        self.reserve_metadata_range(start, self.sb.istore_block_count)
    }

    // 每个元数据块占用一个保留inode
    fn reserve_metadata_range(&mut self, start: u32, count: u32) -> Result<()> {
        let uid = self.sb.uid;
        for block_ptr in start..start + count {
            let inode_number = self.get_next_free_inode()?.ok_or(FsError::NoFreeInode)?;
            self.install_inode(inode_number, DiskInode::reserved(inode_number, uid, block_ptr, now()))?;
        }
        debug!("reserved {} inodes for metadata blocks from {}", count, start);
        Ok(())
    }
}
