use crate::block_cache::BlockCache;
use crate::error::Result;
use crate::layout::{BITS_PER_BLOCK, BLOCK_SIZE};

const WORD_BITS: u64 = 64;

// 把设备上的绝对bit序号拆成 (块号, 块内字节, 字节内bit)
pub fn decompose_bit(bit: u64) -> (u32, usize, u32) {
    let byte = bit / 8;
    let block = (byte / BLOCK_SIZE as u64) as u32;
    let byte_in_block = (byte % BLOCK_SIZE as u64) as usize;
    let bit_in_byte = (bit % 8) as u32;
    return (block, byte_in_block, bit_in_byte);
}

pub fn set_bit(cache: &mut BlockCache, bit: u64) -> Result<()> {
    let (block, byte, offset) = decompose_bit(bit);
    cache.modify(block, |data| data[byte] |= 1 << offset)
}

pub fn clear_bit(cache: &mut BlockCache, bit: u64) -> Result<()> {
    let (block, byte, offset) = decompose_bit(bit);
    cache.modify(block, |data| data[byte] &= !(1 << offset))
}

pub fn get_bit(cache: &mut BlockCache, bit: u64) -> Result<bool> {
    let (block, byte, offset) = decompose_bit(bit);
    cache.read(block, |data| (data[byte] >> offset) & 1 == 1)
}

// Bitmap 一个bitmap区域，每个二进制位表示一个inode或者数据块是否已分配
// 一个bmap块=4KiB，总共32K个id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    first_bm_block: u32,  // bitmap的第一个bm块id
    total_bm_blocks: u32, // bitmap所拥有的bm块总数
    capacity: u32,        // 被管理的id数量
}

impl Bitmap {
    pub fn new(first_bm_block: u32, total_bm_blocks: u32, capacity: u32) -> Self {
        debug_assert!(capacity as u64 <= total_bm_blocks as u64 * BITS_PER_BLOCK);
        return Self {
            first_bm_block,
            total_bm_blocks,
            capacity,
        };
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // 区域内的id对应的绝对bit序号
    pub fn absolute_bit(&self, id: u32) -> u64 {
        self.first_bm_block as u64 * BITS_PER_BLOCK + id as u64
    }

    pub fn get(&self, cache: &mut BlockCache, id: u32) -> Result<bool> {
        debug_assert!(id < self.capacity);
        get_bit(cache, self.absolute_bit(id))
    }

    pub fn set(&self, cache: &mut BlockCache, id: u32) -> Result<()> {
        debug_assert!(id < self.capacity);
        set_bit(cache, self.absolute_bit(id))
    }

    pub fn clear(&self, cache: &mut BlockCache, id: u32) -> Result<()> {
        debug_assert!(id < self.capacity);
        clear_bit(cache, self.absolute_bit(id))
    }

    // 线性扫描，返回第一个为0的id；区域耗尽返回None
    pub fn first_free(&self, cache: &mut BlockCache) -> Result<Option<u32>> {
        for seq in 0..self.total_bm_blocks {
            let bmap_block_id = self.first_bm_block + seq;
            let result = cache.read(bmap_block_id, |data| {
                data.chunks_exact(8)
                    .map(|chunk| {
                        let mut word = [0u8; 8];
                        word.copy_from_slice(chunk);
                        u64::from_le_bytes(word)
                    })
                    .enumerate()
                    .find(|(_, bits)| *bits != u64::MAX) // 非全1
                    .map(|(idx, bits)| (idx as u64, bits.trailing_ones() as u64)) // 找到第一个0
            })?;
            if let Some((idx, offset)) = result {
                let id = seq as u64 * BITS_PER_BLOCK + idx * WORD_BITS + offset;
                if id >= self.capacity as u64 {
                    return Ok(None);
                }
                return Ok(Some(id as u32));
            }
        }
        Ok(None)
    }

    // 已分配的id数量，只统计capacity范围内的bit
    pub fn count_set(&self, cache: &mut BlockCache) -> Result<u32> {
        let mut total = 0u32;
        for seq in 0..self.total_bm_blocks {
            let base = seq as u64 * BITS_PER_BLOCK;
            if base >= self.capacity as u64 {
                break;
            }
            let limit = (self.capacity as u64 - base).min(BITS_PER_BLOCK) as usize;
            total += cache.read(self.first_bm_block + seq, |data| {
                let full_bytes = limit / 8;
                let mut count: u32 = data[..full_bytes].iter().map(|b| b.count_ones()).sum();
                let rest = limit % 8;
                if rest != 0 {
                    count += (data[full_bytes] & ((1u8 << rest) - 1)).count_ones();
                }
                count
            })?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use alloc::sync::Arc;

    fn cache(blocks: u32) -> BlockCache {
        BlockCache::new(Arc::new(MemoryBlockDevice::new(blocks)), 16)
    }

    #[test]
    fn test_decompose_bit() {
        assert_eq!(decompose_bit(0), (0, 0, 0));
        assert_eq!(decompose_bit(13), (0, 1, 5));
        assert_eq!(decompose_bit(BITS_PER_BLOCK), (1, 0, 0));
        assert_eq!(decompose_bit(BITS_PER_BLOCK + 8 * 4095 + 7), (1, 4095, 7));
    }

    #[test]
    fn test_set_get_clear() {
        let mut c = cache(4);
        let bit = BITS_PER_BLOCK + 19;
        assert!(!get_bit(&mut c, bit).unwrap());
        set_bit(&mut c, bit).unwrap();
        assert!(get_bit(&mut c, bit).unwrap());
        // 字节内LSB在前
        let byte = c.read(1, |data| data[2]).unwrap();
        assert_eq!(byte, 1 << 3);
        clear_bit(&mut c, bit).unwrap();
        assert!(!get_bit(&mut c, bit).unwrap());
    }

    #[test]
    fn test_first_free_and_exhaustion() {
        let mut c = cache(4);
        let bmap = Bitmap::new(1, 1, 70);
        assert_eq!(bmap.first_free(&mut c).unwrap(), Some(0));
        for id in 0..65 {
            bmap.set(&mut c, id).unwrap();
        }
        assert_eq!(bmap.first_free(&mut c).unwrap(), Some(65));
        bmap.clear(&mut c, 7).unwrap();
        assert_eq!(bmap.first_free(&mut c).unwrap(), Some(7));
        for id in 0..70 {
            bmap.set(&mut c, id).unwrap();
        }
        assert_eq!(bmap.first_free(&mut c).unwrap(), None);
        assert_eq!(bmap.count_set(&mut c).unwrap(), 70);
    }

    #[test]
    fn test_regions_are_independent() {
        let mut c = cache(4);
        let first = Bitmap::new(1, 1, 100);
        let second = Bitmap::new(2, 1, 100);
        first.set(&mut c, 3).unwrap();
        assert!(!second.get(&mut c, 3).unwrap());
        assert_eq!(second.absolute_bit(3), 2 * BITS_PER_BLOCK + 3);
        assert_eq!(second.count_set(&mut c).unwrap(), 0);
    }

    #[test]
    fn test_count_ignores_bits_past_capacity() {
        let mut c = cache(4);
        let bmap = Bitmap::new(1, 1, 10);
        c.modify(1, |data| data[..4].fill(0xff)).unwrap();
        assert_eq!(bmap.count_set(&mut c).unwrap(), 10);
        assert_eq!(bmap.first_free(&mut c).unwrap(), None);
    }
}
