use crate::layout::{INODE_SIZE, KEY_SIZE};
use byteorder::{ByteOrder, LittleEndian};

// inode记录在inode区中的字段偏移
const OFF_NUMBER: usize = 0;
const OFF_UID: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_KEY: usize = 12;
const OFF_REF_COUNT: usize = 32;
const OFF_FLAGS: usize = 34;
const OFF_MOD_TIME: usize = 40;
const OFF_BLOCK_PTR: usize = 48;

// 保留的inode：superblock inode以及元数据inode，永远不会匹配到用户key
pub const INODE_RESERVED: u16 = 1 << 0;

// 一个inode记录，大小128字节
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskInode {
    pub number: u32,
    pub uid: u32,
    pub size: u32, // 总是等于记录大小
    pub key: [u8; KEY_SIZE],
    pub ref_count: u16,
    pub flags: u16,
    pub mod_time: i64,
    pub block_ptr: u32, // 数据区中的绝对块号
}

impl DiskInode {
    pub fn new(number: u32, uid: u32, key: [u8; KEY_SIZE], block_ptr: u32, mod_time: i64) -> Self {
        return Self {
            number,
            uid,
            size: INODE_SIZE as u32,
            key,
            ref_count: 1,
            flags: 0,
            mod_time,
            block_ptr,
        };
    }

    pub fn reserved(number: u32, uid: u32, block_ptr: u32, mod_time: i64) -> Self {
        let mut inode = Self::new(number, uid, [0u8; KEY_SIZE], block_ptr, mod_time);
        inode.flags |= INODE_RESERVED;
        return inode;
    }

    pub fn is_reserved(&self) -> bool {
        self.flags & INODE_RESERVED != 0
    }

    // 只有非保留且key完全一致才算命中
    pub fn matches(&self, key: &[u8; KEY_SIZE]) -> bool {
        !self.is_reserved() && self.key == *key
    }

    pub fn encode(&self, out: &mut [u8]) {
        let out = &mut out[..INODE_SIZE];
        out.fill(0);
        LittleEndian::write_u32(&mut out[OFF_NUMBER..], self.number);
        LittleEndian::write_u32(&mut out[OFF_UID..], self.uid);
        LittleEndian::write_u32(&mut out[OFF_SIZE..], self.size);
        out[OFF_KEY..OFF_KEY + KEY_SIZE].copy_from_slice(&self.key);
        LittleEndian::write_u16(&mut out[OFF_REF_COUNT..], self.ref_count);
        LittleEndian::write_u16(&mut out[OFF_FLAGS..], self.flags);
        LittleEndian::write_i64(&mut out[OFF_MOD_TIME..], self.mod_time);
        LittleEndian::write_u32(&mut out[OFF_BLOCK_PTR..], self.block_ptr);
    }

    pub fn decode(raw: &[u8]) -> Self {
        let raw = &raw[..INODE_SIZE];
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&raw[OFF_KEY..OFF_KEY + KEY_SIZE]);
        Self {
            number: LittleEndian::read_u32(&raw[OFF_NUMBER..]),
            uid: LittleEndian::read_u32(&raw[OFF_UID..]),
            size: LittleEndian::read_u32(&raw[OFF_SIZE..]),
            key,
            ref_count: LittleEndian::read_u16(&raw[OFF_REF_COUNT..]),
            flags: LittleEndian::read_u16(&raw[OFF_FLAGS..]),
            mod_time: LittleEndian::read_i64(&raw[OFF_MOD_TIME..]),
            block_ptr: LittleEndian::read_u32(&raw[OFF_BLOCK_PTR..]),
        }
    }
}
