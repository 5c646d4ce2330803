use crate::block_device::{read_block, write_block, BlockDevice};
use crate::error::Result;
use crate::layout::{Block, BLOCK_SIZE};
use alloc::boxed::Box;
use alloc::collections::btree_map::Entry;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

// CacheEntry 一个块缓存项
struct CacheEntry {
    block_data: Box<Block>, // 缓存数据
    last_used: u64,         // 最近一次访问的时钟
}

// BlockCache 每个文件系统实例一个，写穿透：写操作返回前数据已经落到设备上
pub struct BlockCache {
    block_device: Arc<dyn BlockDevice>,
    cache_map: BTreeMap<u32, CacheEntry>,
    limit: usize,
    clock: u64,
}

impl BlockCache {
    pub fn new(block_device: Arc<dyn BlockDevice>, limit: usize) -> Self {
        Self {
            block_device,
            cache_map: BTreeMap::new(),
            limit,
            clock: 0,
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }

    pub fn len(&self) -> usize {
        self.cache_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache_map.is_empty()
    }

    // 从块缓存读取数据，然后执行F函数得到V
    pub fn read<V, F>(&mut self, block_id: u32, f: F) -> Result<V>
    where
        F: FnOnce(&Block) -> V,
    {
        if self.limit == 0 {
            let mut data = [0u8; BLOCK_SIZE];
            read_block(self.block_device.as_ref(), block_id, &mut data)?;
            return Ok(f(&data));
        }
        let entry = self.load(block_id)?;
        return Ok(f(&entry.block_data));
    }

    // 读-改-写：修改缓存数据并立即写回设备
    pub fn modify<V, F>(&mut self, block_id: u32, f: F) -> Result<V>
    where
        F: FnOnce(&mut Block) -> V,
    {
        if self.limit == 0 {
            let mut data = [0u8; BLOCK_SIZE];
            read_block(self.block_device.as_ref(), block_id, &mut data)?;
            let value = f(&mut data);
            write_block(self.block_device.as_ref(), block_id, &data)?;
            return Ok(value);
        }
        let device = Arc::clone(&self.block_device);
        let entry = self.load(block_id)?;
        let value = f(&mut entry.block_data);
        if let Err(e) = write_block(device.as_ref(), block_id, &entry.block_data) {
            // 写失败后缓存内容和设备不一致，丢弃该项
            self.cache_map.remove(&block_id);
            return Err(e);
        }
        return Ok(value);
    }

    // 整块覆盖写，不需要先读
    pub fn write(&mut self, block_id: u32, data: &Block) -> Result<()> {
        let result = write_block(self.block_device.as_ref(), block_id, data);
        if result.is_err() || self.limit == 0 {
            self.cache_map.remove(&block_id);
            return result;
        }
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.cache_map.get_mut(&block_id) {
            entry.block_data.copy_from_slice(data);
            entry.last_used = clock;
            return Ok(());
        }
        self.evict_if_full();
        self.cache_map.insert(
            block_id,
            CacheEntry {
                block_data: Box::new(*data),
                last_used: clock,
            },
        );
        Ok(())
    }

    pub fn read_into(&mut self, block_id: u32, out: &mut Block) -> Result<()> {
        self.read(block_id, |data| out.copy_from_slice(data))
    }

    pub fn invalidate(&mut self) {
        self.cache_map.clear();
    }

    // 获取一个磁盘块的缓存项，如果缓存中没有则通过block_device接口读取
    fn load(&mut self, block_id: u32) -> Result<&mut CacheEntry> {
        self.clock += 1;
        let clock = self.clock;
        if !self.cache_map.contains_key(&block_id) {
            self.evict_if_full();
        }
        let device = Arc::clone(&self.block_device);
        let entry = match self.cache_map.entry(block_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let mut data = Box::new([0u8; BLOCK_SIZE]);
                read_block(device.as_ref(), block_id, &mut data)?;
                slot.insert(CacheEntry {
                    block_data: data,
                    last_used: clock,
                })
            }
        };
        entry.last_used = clock;
        return Ok(entry);
    }

    // cache已满，弹出最久没有被使用的entry；数据已经写穿透，直接丢弃即可
    fn evict_if_full(&mut self) {
        if self.cache_map.len() < self.limit {
            return;
        }
        let victim = self
            .cache_map
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id);
        if let Some(id) = victim {
            self.cache_map.remove(&id);
        }
    }
}

#[cfg(test)]
mod block_cache_tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;

    #[test]
    fn test_block_entry_read_write() {
        let dev = Arc::new(MemoryBlockDevice::new(8));
        let mut cache = BlockCache::new(dev.clone(), 4);
        cache
            .modify(3, |data| {
                data.fill(10);
            })
            .unwrap();
        cache
            .read(3, |data| {
                data.iter().for_each(|d| {
                    assert!(*d == 10, "element should be the modified value");
                });
            })
            .unwrap();
        // 写穿透，设备上已经是新数据
        let mut raw = [0u8; BLOCK_SIZE];
        read_block(dev.as_ref(), 3, &mut raw).unwrap();
        assert!(raw.iter().all(|d| *d == 10));
    }

    #[test]
    fn test_eviction_keeps_limit() {
        let dev = Arc::new(MemoryBlockDevice::new(16));
        let mut cache = BlockCache::new(dev, 4);
        for id in 0..10 {
            cache.read(id, |_| ()).unwrap();
        }
        assert_eq!(cache.len(), 4);
        // 最近访问的块仍在缓存中
        assert!(cache.cache_map.contains_key(&9));
        assert!(!cache.cache_map.contains_key(&0));
    }

    #[test]
    fn test_uncached_mode() {
        let dev = Arc::new(MemoryBlockDevice::new(4));
        let mut cache = BlockCache::new(dev.clone(), 0);
        cache.write(1, &[1u8; BLOCK_SIZE]).unwrap();
        let first = cache.modify(1, |data| data[0]).unwrap();
        assert_eq!(first, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_read_is_not_cached() {
        let dev = Arc::new(MemoryBlockDevice::new(2));
        let mut cache = BlockCache::new(dev, 4);
        assert!(cache.read(5, |_| ()).unwrap_err().is_io());
        assert!(cache.is_empty());
    }
}
