// 128位标识符
//
// 卷、chunk、事务共用同一种 GUID: 随机生成 (v4), 磁盘上是裸 16 字节。

use std::fmt;
use uuid::Uuid;

pub const GUID_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Guid([u8; GUID_SIZE]);

impl Guid {
    pub const fn zero() -> Self {
        Guid([0u8; GUID_SIZE])
    }

    /// 随机生成
    pub fn generate() -> Self {
        Guid(*Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; GUID_SIZE]) -> Self {
        Guid(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; GUID_SIZE] = bytes.try_into().ok()?;
        Some(Guid(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; GUID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; GUID_SIZE]
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.0).hyphenated().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = Guid::generate();
        let b = Guid::generate();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_display_format() {
        let id = Guid::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let id = Guid::generate();
        let back = Guid::from_slice(id.as_bytes()).unwrap();
        assert_eq!(id, back);
        assert!(Guid::from_slice(&[0u8; 5]).is_none());
    }

    #[test]
    fn test_zero() {
        assert!(Guid::zero().is_zero());
        assert_eq!(Guid::default(), Guid::zero());
    }
}
