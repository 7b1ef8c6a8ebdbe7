// Journal 磁盘结构定义
//
// 所有 journal 块恰好占一个块 (4096 字节), 多字节字段小端存储。
// 每块末尾 32 字节哈希: xxHash-64 摘要小端放在前 8 字节, 其余补零,
// 覆盖哈希字段之前的全部字节。序列化时先转小端再求哈希,
// 读取时先验哈希再转回主机序。

use crate::error::{Error, Result};
use crate::guid::{Guid, GUID_SIZE};
use crate::page::{Page, PAGE_SIZE};
use std::mem::{offset_of, size_of};
use xxhash_rust::xxh64::xxh64;

pub const JOURNAL_MAGIC: u32 = 0x4A52_4E4C; // "JRNL"
pub const HASH_SIZE: usize = 32;

pub const TX_BLOCK_BEGIN: u32 = 1;
pub const TX_BLOCK_DATA: u32 = 2;
pub const TX_BLOCK_COMMIT: u32 = 3;

/// 事务块里哈希字段的偏移 (块末尾 32 字节)
pub const TX_HASH_OFFSET: usize = PAGE_SIZE - HASH_SIZE;

/// 单个数据块能携带的载荷
pub const TX_DATA_CAPACITY: usize = PAGE_SIZE - GUID_SIZE - 4 - 4 - 8 - HASH_SIZE;

// ============ 事务状态 ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    New,
    Committing,
    Committed,
    Canceled,
}

impl TxState {
    pub fn as_raw(self) -> u32 {
        match self {
            TxState::New => 1,
            TxState::Committing => 2,
            TxState::Committed => 3,
            TxState::Canceled => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Option<TxState> {
        match raw {
            1 => Some(TxState::New),
            2 => Some(TxState::Committing),
            3 => Some(TxState::Committed),
            4 => Some(TxState::Canceled),
            _ => None,
        }
    }
}

// ============ Journal 头 ============

#[repr(C, packed)]
pub struct JournalHeader {
    /// Magic (0x4A524E4C = "JRNL")
    pub magic: u32,
    /// 环大小, 含头块, 必须 ≥ 2
    pub size: u64,
    pub hash: [u8; HASH_SIZE],
}

const HEADER_HASH_OFFSET: usize = offset_of!(JournalHeader, hash);

impl JournalHeader {
    /// 把头块写进页面 (页面先清零)
    pub fn encode_into(page: &Page, size: u64) {
        page.zero();
        page.with_data_mut(|buf| {
            let header = JournalHeader {
                magic: JOURNAL_MAGIC.to_le(),
                size: size.to_le(),
                hash: [0u8; HASH_SIZE],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &header as *const JournalHeader as *const u8,
                    buf.as_mut_ptr(),
                    size_of::<JournalHeader>(),
                );
            }
            let hash = block_hash(&buf[..HEADER_HASH_OFFSET]);
            buf[HEADER_HASH_OFFSET..HEADER_HASH_OFFSET + HASH_SIZE].copy_from_slice(&hash);
        });
    }

    /// 校验并返回环大小
    pub fn decode_from(page: &Page) -> Result<u64> {
        page.with_data(|buf| {
            let header: JournalHeader =
                unsafe { std::ptr::read(buf.as_ptr() as *const JournalHeader) };
            if u32::from_le(header.magic) != JOURNAL_MAGIC {
                return Err(Error::BadMagic);
            }
            if block_hash(&buf[..HEADER_HASH_OFFSET]) != header.hash {
                return Err(Error::DataCorrupt);
            }
            Ok(u64::from_le(header.size))
        })
    }
}

// ============ 事务块 ============

#[repr(C, packed)]
pub struct JournalTxBeginBlock {
    pub tx_id: [u8; GUID_SIZE],
    pub block_type: u32,
    pub reserved: [u8; PAGE_SIZE - GUID_SIZE - 4 - HASH_SIZE],
    pub hash: [u8; HASH_SIZE],
}

#[repr(C, packed)]
pub struct JournalTxDataBlock {
    pub tx_id: [u8; GUID_SIZE],
    pub block_type: u32,
    /// 实际载荷长度 (≤ TX_DATA_CAPACITY)
    pub data_size: u32,
    /// 目标设备字节偏移
    pub position: u64,
    pub data: [u8; TX_DATA_CAPACITY],
    pub hash: [u8; HASH_SIZE],
}

#[repr(C, packed)]
pub struct JournalTxCommitBlock {
    pub tx_id: [u8; GUID_SIZE],
    pub block_type: u32,
    /// 最终状态 (Committed)
    pub state: u32,
    /// 提交时间, 纳秒
    pub time: u64,
    pub reserved: [u8; TX_DATA_CAPACITY],
    pub hash: [u8; HASH_SIZE],
}

const _: () = assert!(size_of::<JournalTxBeginBlock>() == PAGE_SIZE);
const _: () = assert!(size_of::<JournalTxDataBlock>() == PAGE_SIZE);
const _: () = assert!(size_of::<JournalTxCommitBlock>() == PAGE_SIZE);
const _: () = assert!(offset_of!(JournalTxBeginBlock, hash) == TX_HASH_OFFSET);
const _: () = assert!(offset_of!(JournalTxDataBlock, hash) == TX_HASH_OFFSET);
const _: () = assert!(offset_of!(JournalTxCommitBlock, hash) == TX_HASH_OFFSET);

/// 内存中的事务块表示, 写盘/重放时与磁盘布局互转
#[derive(Clone)]
pub enum TxBlock {
    Begin {
        tx_id: Guid,
    },
    Data {
        tx_id: Guid,
        position: u64,
        data: Vec<u8>,
    },
    Commit {
        tx_id: Guid,
        state: TxState,
        time: u64,
    },
}

impl TxBlock {
    pub fn tx_id(&self) -> Guid {
        match self {
            TxBlock::Begin { tx_id } => *tx_id,
            TxBlock::Data { tx_id, .. } => *tx_id,
            TxBlock::Commit { tx_id, .. } => *tx_id,
        }
    }

    pub fn encode_into(&self, page: &Page) -> Result<()> {
        match self {
            TxBlock::Begin { tx_id } => {
                let block = JournalTxBeginBlock {
                    tx_id: *tx_id.as_bytes(),
                    block_type: TX_BLOCK_BEGIN.to_le(),
                    reserved: [0u8; PAGE_SIZE - GUID_SIZE - 4 - HASH_SIZE],
                    hash: [0u8; HASH_SIZE],
                };
                encode_tx_block(page, &block);
            }
            TxBlock::Data {
                tx_id,
                position,
                data,
            } => {
                if data.is_empty() || data.len() > TX_DATA_CAPACITY {
                    return Err(Error::InvalidValue);
                }
                let mut block = JournalTxDataBlock {
                    tx_id: *tx_id.as_bytes(),
                    block_type: TX_BLOCK_DATA.to_le(),
                    data_size: (data.len() as u32).to_le(),
                    position: position.to_le(),
                    data: [0u8; TX_DATA_CAPACITY],
                    hash: [0u8; HASH_SIZE],
                };
                block.data[..data.len()].copy_from_slice(data);
                encode_tx_block(page, &block);
            }
            TxBlock::Commit { tx_id, state, time } => {
                let block = JournalTxCommitBlock {
                    tx_id: *tx_id.as_bytes(),
                    block_type: TX_BLOCK_COMMIT.to_le(),
                    state: state.as_raw().to_le(),
                    time: time.to_le(),
                    reserved: [0u8; TX_DATA_CAPACITY],
                    hash: [0u8; HASH_SIZE],
                };
                encode_tx_block(page, &block);
            }
        }
        Ok(())
    }

    /// 哈希不符返回 DataCorrupt, 未知类型返回 InvalidValue
    pub fn decode_from(page: &Page) -> Result<TxBlock> {
        page.with_data(|buf| {
            let hash = block_hash(&buf[..TX_HASH_OFFSET]);
            if buf[TX_HASH_OFFSET..] != hash {
                return Err(Error::DataCorrupt);
            }

            let tx_id = Guid::from_slice(&buf[..GUID_SIZE]).ok_or(Error::DataCorrupt)?;
            let block_type =
                u32::from_le_bytes(buf[GUID_SIZE..GUID_SIZE + 4].try_into().unwrap());

            match block_type {
                TX_BLOCK_BEGIN => Ok(TxBlock::Begin { tx_id }),
                TX_BLOCK_DATA => {
                    let block: JournalTxDataBlock =
                        unsafe { std::ptr::read(buf.as_ptr() as *const JournalTxDataBlock) };
                    let data_size = u32::from_le(block.data_size) as usize;
                    if data_size == 0 || data_size > TX_DATA_CAPACITY {
                        return Err(Error::DataCorrupt);
                    }
                    Ok(TxBlock::Data {
                        tx_id,
                        position: u64::from_le(block.position),
                        data: block.data[..data_size].to_vec(),
                    })
                }
                TX_BLOCK_COMMIT => {
                    let block: JournalTxCommitBlock =
                        unsafe { std::ptr::read(buf.as_ptr() as *const JournalTxCommitBlock) };
                    let state = TxState::from_raw(u32::from_le(block.state))
                        .ok_or(Error::DataCorrupt)?;
                    Ok(TxBlock::Commit {
                        tx_id,
                        state,
                        time: u64::from_le(block.time),
                    })
                }
                _ => Err(Error::InvalidValue),
            }
        })
    }
}

/// 事务块统一的落页序列: 拷入已转小端的整块结构, 再把哈希写到块尾。
/// 三种事务块共享同一个哈希偏移 (TX_HASH_OFFSET), 结构必须整块大小。
fn encode_tx_block<T>(page: &Page, block: &T) {
    debug_assert_eq!(size_of::<T>(), PAGE_SIZE);
    page.with_data_mut(|buf| {
        unsafe {
            std::ptr::copy_nonoverlapping(
                block as *const T as *const u8,
                buf.as_mut_ptr(),
                PAGE_SIZE,
            );
        }
        let hash = block_hash(&buf[..TX_HASH_OFFSET]);
        buf[TX_HASH_OFFSET..].copy_from_slice(&hash);
    });
}

pub fn block_hash(bytes: &[u8]) -> [u8; HASH_SIZE] {
    let mut hash = [0u8; HASH_SIZE];
    hash[..8].copy_from_slice(&xxh64(bytes, 0).to_le_bytes());
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let page = Page::new();
        JournalHeader::encode_into(&page, 128);
        assert_eq!(JournalHeader::decode_from(&page).unwrap(), 128);
    }

    #[test]
    fn test_header_bad_magic() {
        let page = Page::new();
        JournalHeader::encode_into(&page, 128);
        page.write(&[0xFF; 4], 0);
        assert!(matches!(
            JournalHeader::decode_from(&page),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn test_header_bad_hash() {
        let page = Page::new();
        JournalHeader::encode_into(&page, 128);
        // 改动 size 但不重算哈希
        page.write(&64u64.to_le_bytes(), 4);
        assert!(matches!(
            JournalHeader::decode_from(&page),
            Err(Error::DataCorrupt)
        ));
    }

    #[test]
    fn test_zero_page_is_torn() {
        let page = Page::new();
        assert!(matches!(
            TxBlock::decode_from(&page),
            Err(Error::DataCorrupt)
        ));
    }

    #[test]
    fn test_data_block_roundtrip() {
        let page = Page::new();
        let tx_id = Guid::generate();
        let src = TxBlock::Data {
            tx_id,
            position: 8192,
            data: vec![0xAB; 1000],
        };
        src.encode_into(&page).unwrap();

        match TxBlock::decode_from(&page).unwrap() {
            TxBlock::Data {
                tx_id: id,
                position,
                data,
            } => {
                assert_eq!(id, tx_id);
                assert_eq!(position, 8192);
                assert_eq!(data, vec![0xAB; 1000]);
            }
            _ => panic!("wrong block type"),
        }
    }

    #[test]
    fn test_data_block_capacity() {
        let page = Page::new();
        let oversized = TxBlock::Data {
            tx_id: Guid::generate(),
            position: 8192,
            data: vec![0; TX_DATA_CAPACITY + 1],
        };
        assert!(matches!(
            oversized.encode_into(&page),
            Err(Error::InvalidValue)
        ));
    }

    #[test]
    fn test_commit_block_roundtrip() {
        let page = Page::new();
        let tx_id = Guid::generate();
        TxBlock::Commit {
            tx_id,
            state: TxState::Committed,
            time: 123_456_789,
        }
        .encode_into(&page)
        .unwrap();

        match TxBlock::decode_from(&page).unwrap() {
            TxBlock::Commit { tx_id: id, state, time } => {
                assert_eq!(id, tx_id);
                assert_eq!(state, TxState::Committed);
                assert_eq!(time, 123_456_789);
            }
            _ => panic!("wrong block type"),
        }
    }

    #[test]
    fn test_unknown_type() {
        let page = Page::new();
        TxBlock::Begin {
            tx_id: Guid::generate(),
        }
        .encode_into(&page)
        .unwrap();
        // 伪造未知类型并重算哈希, 确认类型检查独立于哈希检查
        page.write(&99u32.to_le_bytes(), GUID_SIZE);
        page.with_data_mut(|buf| {
            let hash = block_hash(&buf[..TX_HASH_OFFSET]);
            buf[TX_HASH_OFFSET..].copy_from_slice(&hash);
        });
        assert!(matches!(
            TxBlock::decode_from(&page),
            Err(Error::InvalidValue)
        ));
    }

    #[test]
    fn test_corrupted_data_block() {
        let page = Page::new();
        TxBlock::Data {
            tx_id: Guid::generate(),
            position: 8192,
            data: vec![0x55; 64],
        }
        .encode_into(&page)
        .unwrap();
        page.write(&[0x00], 40);
        assert!(matches!(
            TxBlock::decode_from(&page),
            Err(Error::DataCorrupt)
        ));
    }
}
