use crate::error::FsError;
use crate::layout::KEY_SIZE;
use core::fmt;
use core::str::FromStr;

// 160位key，外部以40个十六进制字符表示
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    // 每两个十六进制字符解码成一个字节
    pub fn from_hex(name: &str) -> Result<Self, FsError> {
        let raw = name.as_bytes();
        if raw.len() != KEY_SIZE * 2 {
            return Err(FsError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                KEY_SIZE * 2,
                raw.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        for (i, pair) in raw.chunks_exact(2).enumerate() {
            let hi = hex_value(pair[0]);
            let lo = hex_value(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => key[i] = (hi << 4) | lo,
                _ => {
                    return Err(FsError::InvalidKey(format!(
                        "invalid hex digit near position {}",
                        i * 2
                    )))
                }
            }
        }
        return Ok(Self(key));
    }
}

// 文件名形式的key，例如镜像工具从主机文件名得到key
pub fn file_name_to_key(name: &str) -> Result<Key, FsError> {
    Key::from_hex(name)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl FromStr for Key {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; KEY_SIZE]> for Key {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

#[cfg(test)]
mod key_tests {
    use super::*;

    #[test]
    fn test_parse_hex_name() {
        let key: Key = "5eee38381388b6f30efdd5c5c6f067dbf32c0bb3".parse().unwrap();
        assert_eq!(key.0[0], 0x5e);
        assert_eq!(key.0[1], 0xee);
        assert_eq!(key.0[19], 0xb3);
        assert_eq!(key.to_string(), "5eee38381388b6f30efdd5c5c6f067dbf32c0bb3");
    }

    #[test]
    fn test_uppercase_accepted() {
        let lower = Key::from_hex("00112233445566778899aabbccddeeff00112233").unwrap();
        let upper = Key::from_hex("00112233445566778899AABBCCDDEEFF00112233").unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(Key::from_hex("abc"), Err(FsError::InvalidKey(_))));
        assert!(matches!(
            Key::from_hex("zz112233445566778899aabbccddeeff00112233"),
            Err(FsError::InvalidKey(_))
        ));
        assert!(Key::from_hex("00112233445566778899aabbccddeeff0011223344").is_err());
        assert!(file_name_to_key("ééé").is_err());
    }
}
