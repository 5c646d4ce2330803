// 一个磁盘块的大小：4KiB
pub const BLOCK_SIZE: usize = 4096;
// 一个bitmap块能够管理的id数量：4096 * 8 = 32K
pub const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

pub const DDFS_MAGIC: u32 = 0xBA5ED;
pub const DDFS_VERSION: u32 = 1;
pub const DDFS_NAME: &str = "ddfs";
pub const NAME_LEN: usize = 12;

// key和digest都是160位
pub const KEY_SIZE: usize = 20;
pub const DIGEST_SIZE: usize = KEY_SIZE;

// inode记录固定128字节，一个块32个
pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

// inode 0 是保留的superblock inode
pub const SENTINEL_INODE: u32 = 0;

pub type Block = [u8; BLOCK_SIZE];
pub type Digest = [u8; DIGEST_SIZE];

pub fn div_ceil(a: u64, b: u64) -> u64 {
    return (a + b - 1) / b;
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0, 32), 0);
        assert_eq!(div_ceil(1, 32), 1);
        assert_eq!(div_ceil(32, 32), 1);
        assert_eq!(div_ceil(33, 32), 2);
        assert_eq!(div_ceil(1024, BITS_PER_BLOCK), 1);
    }

    #[test]
    fn test_inode_packing() {
        assert_eq!(INODES_PER_BLOCK * INODE_SIZE, BLOCK_SIZE);
    }
}
