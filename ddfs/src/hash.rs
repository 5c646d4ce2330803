use crate::layout::{Block, Digest, DIGEST_SIZE, KEY_SIZE};

const MIX_C1: u64 = 0xff51_afd7_ed55_8ccd;
const MIX_C2: u64 = 0xc4ce_b9fe_1a85_ec53;

// key_hash 把160位key映射到 [0, modulus) 区间，用于选择inode槽位和数据块
pub fn key_hash(key: &[u8; KEY_SIZE], modulus: u64) -> u64 {
    if modulus == 0 {
        return 0;
    }
    let mut result: u64 = 0;
    for byte in key {
        result ^= *byte as u64;
        result ^= result >> 33;
        result = result.wrapping_mul(MIX_C1);
        result ^= result >> 33;
        result = result.wrapping_mul(MIX_C2);
        result ^= result >> 33;
    }
    return result % modulus;
}

// hash_block 把4096字节折叠进20个单字节累加器，第i个字节落在 i % 20
// 累加器是u8，乘法常数按8位截断
pub fn hash_block(block: &Block) -> Digest {
    let mut result = [0u8; DIGEST_SIZE];
    for (i, byte) in block.iter().enumerate() {
        let acc = &mut result[i % DIGEST_SIZE];
        *acc ^= *byte;
        *acc ^= *acc >> 5;
        *acc = acc.wrapping_mul(MIX_C1 as u8);
        *acc ^= *acc >> 5;
        *acc = acc.wrapping_mul(MIX_C2 as u8);
        *acc ^= *acc >> 5;
    }
    return result;
}
