use crate::block_device::BlockDevice;
use crate::config::{FormatOptions, MountOptions};
use crate::dedup_fs::{CheckReport, DedupFileSystem, FsStat};
use crate::error::{FsError, Result};
use crate::hash::{hash_block, key_hash};
use crate::inode::DiskInode;
use crate::inode_store::now;
use crate::key::Key;
use crate::layout::{Block, Digest};
use crate::super_block::SuperBlock;
use alloc::sync::Arc;
use log::{debug, warn};
use spin::mutex::Mutex;

// 探测key所在的inode槽位的结果
enum Probe {
    Found(u32, DiskInode),
    // 第一个空槽位；整张表都被占用时为None
    Vacant(Option<u32>),
}

// 键值操作，每个操作都在一次加锁内完成
impl DedupFileSystem {
    fn probe(&mut self, key: &Key) -> Result<Probe> {
        let slots = self.sb.inode_count as u64;
        let home = key_hash(key.as_bytes(), slots);
        for step in 0..slots {
            let slot = ((home + step) % slots) as u32;
            if !self.get_inode_bit(slot)? {
                return Ok(Probe::Vacant(Some(slot)));
            }
            let inode = self.read_inode_raw(slot)?;
            if inode.matches(key.as_bytes()) {
                return Ok(Probe::Found(slot, inode));
            }
        }
        Ok(Probe::Vacant(None))
    }

    fn data_home(&self, digest: &Digest) -> u32 {
        self.sb.data_start_block() + key_hash(digest, self.sb.data_block_count as u64) as u32
    }

    // 块已分配，摘要相同并且内容逐字节相同
    fn holds_content(&mut self, block_id: u32, value: &Block, digest: &Digest) -> Result<bool> {
        if !self.sb.is_data_block(block_id) || !self.get_block_bit(block_id)? {
            return Ok(false);
        }
        self.cache
            .read(block_id, |data| hash_block(data) == *digest && data[..] == value[..])
    }

    pub fn block_exists(&mut self, value: &Block) -> Result<bool> {
        let digest = hash_block(value);
        let home = self.data_home(&digest);
        self.holds_content(home, value, &digest)
    }

    // 为内容找到数据块，返回 (块号, 是否新写入)
    fn place_block(&mut self, value: &Block, digest: &Digest) -> Result<(u32, bool)> {
        let home = self.data_home(digest);
        if !self.get_block_bit(home)? {
            self.write_data_block(home, value)?;
            self.allocate_block(home)?;
            return Ok((home, true));
        }
        if self.holds_content(home, value, digest)? {
            debug!("dedup hit on block {}", home);
            return Ok((home, false));
        }
        // 摘要冲突或者块被其他内容占用，退回到线性分配
        warn!("block {} holds other content, falling back to first free block", home);
        let block_id = self.get_next_free_block()?.ok_or(FsError::NoFreeBlock)?;
        self.write_data_block(block_id, value)?;
        self.allocate_block(block_id)?;
        return Ok((block_id, true));
    }

    pub fn create_kv_pair(&mut self, key: &Key, value: &Block) -> Result<()> {
        match self.probe(key)? {
            Probe::Found(slot, inode) => {
                let digest = hash_block(value);
                if !self.holds_content(inode.block_ptr, value, &digest)? {
                    return Err(FsError::KeyExists);
                }
                let count = self.increment_reference_count(slot)?;
                debug!("{} already stored, reference count {}", key, count);
                Ok(())
            }
            Probe::Vacant(None) => Err(FsError::NoFreeInode),
            Probe::Vacant(Some(slot)) => {
                let digest = hash_block(value);
                let (block_ptr, fresh) = self.place_block(value, &digest)?;
                if let Err(err) = self.initialize_inode(slot, key.as_bytes(), block_ptr) {
                    if fresh {
                        let _ = self.release_block(block_ptr);
                    }
                    return Err(err);
                }
                debug!("stored {} in inode {} -> block {}", key, slot, block_ptr);
                Ok(())
            }
        }
    }

    pub fn get_value(&mut self, key: &Key, out: &mut Block) -> Result<()> {
        match self.probe(key)? {
            Probe::Found(_, inode) => self.read_data_block(inode.block_ptr, out),
            Probe::Vacant(_) => Err(FsError::NotFound),
        }
    }

    pub fn contains_key(&mut self, key: &Key) -> Result<bool> {
        Ok(matches!(self.probe(key)?, Probe::Found(..)))
    }

    pub fn reference_count(&mut self, key: &Key) -> Result<u16> {
        match self.probe(key)? {
            Probe::Found(_, inode) => Ok(inode.ref_count),
            Probe::Vacant(_) => Err(FsError::NotFound),
        }
    }

    // 删除不存在的key也算成功
    pub fn delete_kv_pair(&mut self, key: &Key) -> Result<()> {
        let (slot, inode) = match self.probe(key)? {
            Probe::Found(slot, inode) => (slot, inode),
            Probe::Vacant(_) => {
                debug!("delete of absent key {}", key);
                return Ok(());
            }
        };
        if inode.ref_count > 1 {
            self.decrement_reference_count(slot)?;
            return Ok(());
        }
        self.remove_slot(slot, inode.block_ptr)
    }

    fn remove_slot(&mut self, slot: u32, block_ptr: u32) -> Result<()> {
        self.unlink_slot(slot)?;
        self.release_if_unreferenced(block_ptr)
    }

    fn release_if_unreferenced(&mut self, block_ptr: u32) -> Result<()> {
        if !self.sb.is_data_block(block_ptr) || self.block_is_referenced(block_ptr)? {
            return Ok(());
        }
        self.release_block(block_ptr)
    }

    // 释放槽位，并把后面探测链上的记录前移填补空洞
    fn unlink_slot(&mut self, slot: u32) -> Result<()> {
        self.free_inode(slot)?;
        let slots = self.sb.inode_count as u64;
        let mut hole = slot as u64;
        let mut j = (hole + 1) % slots;
        while j != slot as u64 {
            let current = j as u32;
            if !self.get_inode_bit(current)? {
                break;
            }
            let inode = self.read_inode_raw(current)?;
            if !inode.is_reserved() {
                let home = key_hash(&inode.key, slots);
                // hole 在 [home, j) 的循环区间内时才能前移
                if (hole + slots - home) % slots < (j + slots - home) % slots {
                    let mut moved = inode;
                    moved.number = hole as u32;
                    self.write_inode(hole as u32, &moved)?;
                    self.set_inode_bit(hole as u32)?;
                    self.write_inode(current, &DiskInode::default())?;
                    self.clear_inode_bit(current)?;
                    warn!("probe chain repair moved inode {} to {}", current, hole);
                    hole = j;
                }
            }
            j = (j + 1) % slots;
        }
        Ok(())
    }

    pub fn rename_key(&mut self, old: &Key, new: &Key) -> Result<()> {
        let (old_slot, old_inode) = match self.probe(old)? {
            Probe::Found(slot, inode) => (slot, inode),
            Probe::Vacant(_) => return Err(FsError::NotFound),
        };
        if old == new {
            return Ok(());
        }
        if let Probe::Found(..) = self.probe(new)? {
            return Err(FsError::KeyExists);
        }
        self.unlink_slot(old_slot)?;
        let mut renamed = old_inode.clone();
        renamed.key = *new.as_bytes();
        renamed.mod_time = now();
        match self.probe(new) {
            Ok(Probe::Vacant(Some(slot))) => {
                self.install_inode(slot, renamed)?;
                debug!("renamed {} to {} in inode {}", old, new, slot);
                Ok(())
            }
            other => {
                // 放回原来的key
                if let Ok(Probe::Vacant(Some(slot))) = self.probe(old) {
                    self.install_inode(slot, old_inode)?;
                }
                match other {
                    Err(err) => Err(err),
                    _ => Err(FsError::NoFreeInode),
                }
            }
        }
    }

    // 覆盖写：先移除key的所有引用，再以引用计数1重新创建
    pub fn modify_value(&mut self, key: &Key, value: &Block) -> Result<()> {
        if let Probe::Found(slot, inode) = self.probe(key)? {
            self.remove_slot(slot, inode.block_ptr)?;
        }
        self.create_kv_pair(key, value)
    }
}

// KvStore 线程安全的键值存储句柄，可以在线程之间clone
#[derive(Clone)]
pub struct KvStore {
    fs: Arc<Mutex<DedupFileSystem>>,
}

impl KvStore {
    pub fn format(block_dev: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<Self> {
        let fs = DedupFileSystem::format(block_dev, options)?;
        Ok(Self::from_fs(fs))
    }

    pub fn open(block_dev: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let fs = DedupFileSystem::open(block_dev, options)?;
        Ok(Self::from_fs(fs))
    }

    pub fn from_fs(fs: DedupFileSystem) -> Self {
        Self {
            fs: Arc::new(Mutex::new(fs)),
        }
    }

    pub fn create_kv_pair(&self, key: &Key, value: &Block) -> Result<()> {
        self.fs.lock().create_kv_pair(key, value)
    }

    pub fn get_value(&self, key: &Key, out: &mut Block) -> Result<()> {
        self.fs.lock().get_value(key, out)
    }

    pub fn delete_kv_pair(&self, key: &Key) -> Result<()> {
        self.fs.lock().delete_kv_pair(key)
    }

    pub fn rename_key(&self, old: &Key, new: &Key) -> Result<()> {
        self.fs.lock().rename_key(old, new)
    }

    pub fn modify_value(&self, key: &Key, value: &Block) -> Result<()> {
        self.fs.lock().modify_value(key, value)
    }

    pub fn block_exists(&self, value: &Block) -> Result<bool> {
        self.fs.lock().block_exists(value)
    }

    pub fn contains_key(&self, key: &Key) -> Result<bool> {
        self.fs.lock().contains_key(key)
    }

    pub fn reference_count(&self, key: &Key) -> Result<u16> {
        self.fs.lock().reference_count(key)
    }

    pub fn stat(&self) -> FsStat {
        self.fs.lock().stat()
    }

    pub fn check(&self) -> Result<CheckReport> {
        self.fs.lock().check()
    }

    pub fn superblock(&self) -> SuperBlock {
        self.fs.lock().superblock().clone()
    }
}

#[cfg(test)]
mod kv_tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use crate::layout::BLOCK_SIZE;
    use std::io;
    use std::thread;

    fn store(blocks: u32, options: &FormatOptions) -> KvStore {
        KvStore::format(Arc::new(MemoryBlockDevice::new(blocks)), options).unwrap()
    }

    fn key(seed: u8) -> Key {
        let mut raw = [seed; 20];
        raw[0] = seed.wrapping_mul(31);
        Key::new(raw)
    }

    #[test]
    fn test_create_and_get() {
        let kv = store(256, &FormatOptions::default());
        let value = [0x5au8; BLOCK_SIZE];
        kv.create_kv_pair(&key(1), &value).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        kv.get_value(&key(1), &mut out).unwrap();
        assert_eq!(out[..], value[..]);
        assert!(kv.contains_key(&key(1)).unwrap());
        assert!(matches!(kv.get_value(&key(2), &mut out), Err(FsError::NotFound)));
    }

    #[test]
    fn test_zero_key_skips_sentinel() {
        let kv = store(256, &FormatOptions::default());
        let zero = Key::default();
        kv.create_kv_pair(&zero, &[7u8; BLOCK_SIZE]).unwrap();
        let mut fs = kv.fs.lock();
        assert!(fs.get_inode(0).unwrap().is_reserved());
        assert_eq!(fs.get_inode(1).unwrap().key, [0u8; 20]);
    }

    #[test]
    fn test_same_content_shares_block() {
        let kv = store(256, &FormatOptions::default());
        let value = [0xaau8; BLOCK_SIZE];
        kv.create_kv_pair(&key(1), &value).unwrap();
        let free = kv.stat().free_blocks;
        kv.create_kv_pair(&key(2), &value).unwrap();
        assert_eq!(kv.stat().free_blocks, free);
        kv.delete_kv_pair(&key(1)).unwrap();
        // 另一个key仍然引用数据块
        assert!(kv.block_exists(&value).unwrap());
        kv.delete_kv_pair(&key(2)).unwrap();
        assert!(!kv.block_exists(&value).unwrap());
        assert_eq!(kv.stat().free_blocks, free + 1);
    }

    #[test]
    fn test_conflicting_create() {
        let kv = store(256, &FormatOptions::default());
        kv.create_kv_pair(&key(1), &[1u8; BLOCK_SIZE]).unwrap();
        assert!(matches!(
            kv.create_kv_pair(&key(1), &[2u8; BLOCK_SIZE]),
            Err(FsError::KeyExists)
        ));
        kv.create_kv_pair(&key(1), &[1u8; BLOCK_SIZE]).unwrap();
        assert_eq!(kv.reference_count(&key(1)).unwrap(), 2);
    }

    #[test]
    fn test_colliding_homes_probe_and_repair() {
        // 3个槽位：哨兵、两个用户key必然落在同一条探测链上
        let kv = store(64, &FormatOptions::default().with_inode_count(3));
        let a = key(1);
        let b = key(2);
        kv.create_kv_pair(&a, &[1u8; BLOCK_SIZE]).unwrap();
        kv.create_kv_pair(&b, &[2u8; BLOCK_SIZE]).unwrap();
        assert!(matches!(
            kv.create_kv_pair(&key(3), &[3u8; BLOCK_SIZE]),
            Err(FsError::NoFreeInode)
        ));
        kv.delete_kv_pair(&a).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        kv.get_value(&b, &mut out).unwrap();
        assert_eq!(out[0], 2);
        kv.create_kv_pair(&key(3), &[3u8; BLOCK_SIZE]).unwrap();
        assert!(kv.check().unwrap().is_clean());
    }

    #[test]
    fn test_delete_keeps_chain_reachable() {
        let kv = store(512, &FormatOptions::default().with_inode_count(8));
        let keys: alloc::vec::Vec<Key> = (1..=7).map(key).collect();
        for (i, k) in keys.iter().enumerate() {
            kv.create_kv_pair(k, &[i as u8 + 1; BLOCK_SIZE]).unwrap();
        }
        for k in keys.iter().step_by(2) {
            kv.delete_kv_pair(k).unwrap();
        }
        let mut out = [0u8; BLOCK_SIZE];
        for (i, k) in keys.iter().enumerate() {
            let result = kv.get_value(k, &mut out);
            if i % 2 == 0 {
                assert!(matches!(result, Err(FsError::NotFound)));
            } else {
                result.unwrap();
                assert_eq!(out[0], i as u8 + 1);
            }
        }
        assert!(kv.check().unwrap().is_clean());
    }

    #[test]
    fn test_rename_moves_key() {
        let kv = store(256, &FormatOptions::default());
        let value = [4u8; BLOCK_SIZE];
        kv.create_kv_pair(&key(1), &value).unwrap();
        kv.create_kv_pair(&key(1), &value).unwrap();
        kv.rename_key(&key(1), &key(2)).unwrap();
        assert!(!kv.contains_key(&key(1)).unwrap());
        assert_eq!(kv.reference_count(&key(2)).unwrap(), 2);
        assert!(kv.block_exists(&value).unwrap());
        kv.rename_key(&key(2), &key(2)).unwrap();
        assert!(matches!(kv.rename_key(&key(1), &key(3)), Err(FsError::NotFound)));
        kv.create_kv_pair(&key(3), &[5u8; BLOCK_SIZE]).unwrap();
        assert!(matches!(kv.rename_key(&key(2), &key(3)), Err(FsError::KeyExists)));
    }

    #[test]
    fn test_modify_replaces_value() {
        let kv = store(256, &FormatOptions::default());
        kv.create_kv_pair(&key(1), &[1u8; BLOCK_SIZE]).unwrap();
        kv.create_kv_pair(&key(1), &[1u8; BLOCK_SIZE]).unwrap();
        kv.modify_value(&key(1), &[2u8; BLOCK_SIZE]).unwrap();
        assert_eq!(kv.reference_count(&key(1)).unwrap(), 1);
        assert!(!kv.block_exists(&[1u8; BLOCK_SIZE]).unwrap());
        let mut out = [0u8; BLOCK_SIZE];
        kv.get_value(&key(1), &mut out).unwrap();
        assert_eq!(out[0], 2);
        // 不存在的key直接创建
        kv.modify_value(&key(9), &[3u8; BLOCK_SIZE]).unwrap();
        assert!(kv.contains_key(&key(9)).unwrap());
    }

    #[test]
    fn test_occupied_home_falls_back() {
        let kv = store(256, &FormatOptions::default());
        let value = [6u8; BLOCK_SIZE];
        let home = {
            let fs = kv.fs.lock();
            fs.data_home(&hash_block(&value))
        };
        {
            let mut fs = kv.fs.lock();
            fs.write_data_block(home, &[0xffu8; BLOCK_SIZE]).unwrap();
            fs.allocate_block(home).unwrap();
        }
        kv.create_kv_pair(&key(1), &value).unwrap();
        let mut fs = kv.fs.lock();
        let (slot, inode) = match fs.probe(&key(1)).unwrap() {
            Probe::Found(slot, inode) => (slot, inode),
            Probe::Vacant(_) => panic!("key missing"),
        };
        assert_ne!(inode.block_ptr, home);
        assert_eq!(fs.get_reference_count(slot).unwrap(), 1);
    }

    // 在固定次数的写操作后失败的设备
    struct FailingDevice {
        inner: MemoryBlockDevice,
        writes_left: Mutex<u32>,
    }

    impl BlockDevice for FailingDevice {
        fn read(&self, block_id: u32, data: &mut [u8]) -> io::Result<usize> {
            self.inner.read(block_id, data)
        }

        fn write(&self, block_id: u32, data: &[u8]) -> io::Result<usize> {
            let mut left = self.writes_left.lock();
            if *left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "injected failure"));
            }
            *left -= 1;
            self.inner.write(block_id, data)
        }

        fn media_size(&self) -> io::Result<u64> {
            self.inner.media_size()
        }
    }

    #[test]
    fn test_device_errors_surface() {
        let dev = Arc::new(FailingDevice {
            inner: MemoryBlockDevice::new(128),
            writes_left: Mutex::new(u32::MAX),
        });
        let kv = KvStore::format(dev.clone(), &FormatOptions::default()).unwrap();
        *dev.writes_left.lock() = 0;
        let err = kv.create_kv_pair(&key(1), &[1u8; BLOCK_SIZE]).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_concurrent_writers() {
        let kv = store(1024, &FormatOptions::default());
        let handles: alloc::vec::Vec<_> = (0..4u8)
            .map(|t| {
                let kv = kv.clone();
                thread::spawn(move || {
                    for i in 0..16u8 {
                        let mut raw = [0u8; 20];
                        raw[0] = t;
                        raw[1] = i;
                        raw[19] = 1;
                        kv.create_kv_pair(&Key::new(raw), &[t * 16 + i; BLOCK_SIZE]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stat = kv.stat();
        assert_eq!(stat.free_inodes, stat.inode_count - 1 - 64);
        assert!(kv.check().unwrap().is_clean());
    }
}
