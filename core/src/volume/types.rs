// 卷磁盘结构定义
//
// 布局: [超级块][journal 环][chunk 表][chunk 数据槽...]
// 超级块在块 0, 记录卷 GUID 和各区域几何; 末尾 32 字节哈希
// 与 journal 块同一套规则 (xxHash-64 小端放前 8 字节)。

use crate::error::{Error, Result};
use crate::guid::{Guid, GUID_SIZE};
use crate::journal::types::{block_hash, HASH_SIZE};
use crate::page::{Page, PAGE_SIZE};
use std::mem::{offset_of, size_of};

pub const VOLUME_MAGIC: u32 = 0x4353_5452; // "CSTR"
pub const VOLUME_VERSION: u32 = 1;

/// chunk 载荷固定 64 KiB = 16 块
pub const CHUNK_SIZE: usize = 65536;
pub const CHUNK_BLOCKS: u64 = (CHUNK_SIZE / PAGE_SIZE) as u64;

pub const CHUNK_ENTRY_SIZE: usize = 64;
pub const ENTRIES_PER_BLOCK: usize = PAGE_SIZE / CHUNK_ENTRY_SIZE;
pub const CHUNK_ENTRY_USED: u32 = 1;

/// 卷的最小规模 (块)
pub const MIN_VOLUME_BLOCKS: u64 = 64;

const JOURNAL_MIN_BLOCKS: u64 = 16;
const JOURNAL_MAX_BLOCKS: u64 = 4096;

// ============ 超级块 ============

#[repr(C, packed)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub reserved: u32,
    pub volume_id: [u8; GUID_SIZE],
    pub total_blocks: u64,
    pub journal_start: u64,
    pub journal_size: u64,
    pub table_start: u64,
    pub table_blocks: u64,
    pub data_start: u64,
    pub max_chunks: u64,
    pub hash: [u8; HASH_SIZE],
}

const SB_HASH_OFFSET: usize = offset_of!(Superblock, hash);

/// 解码后的卷几何
#[derive(Debug, Clone, Copy)]
pub struct VolumeLayout {
    pub volume_id: Guid,
    pub block_size: u32,
    pub total_blocks: u64,
    pub journal_start: u64,
    pub journal_size: u64,
    pub table_start: u64,
    pub table_blocks: u64,
    pub data_start: u64,
    pub max_chunks: u64,
}

impl VolumeLayout {
    /// 由设备规模推导布局。
    ///
    /// journal 取总量的 1/8 (夹在 16..4096 块之间); 表区按
    /// "一个表块管 64 个槽, 一个槽占 16 块" 比例切分剩余空间。
    pub fn compute(total_blocks: u64, volume_id: Guid) -> Result<VolumeLayout> {
        if total_blocks < MIN_VOLUME_BLOCKS {
            return Err(Error::BadSize);
        }

        let journal_start = 1u64;
        let journal_size = (total_blocks / 8).clamp(JOURNAL_MIN_BLOCKS, JOURNAL_MAX_BLOCKS);
        let remaining = total_blocks - journal_start - journal_size;
        if remaining < 1 + CHUNK_BLOCKS {
            return Err(Error::BadSize);
        }

        let table_blocks = (remaining / (1 + ENTRIES_PER_BLOCK as u64 * CHUNK_BLOCKS)).max(1);
        let table_start = journal_start + journal_size;
        let data_start = table_start + table_blocks;
        let slot_capacity = (remaining - table_blocks) / CHUNK_BLOCKS;
        let max_chunks = (table_blocks * ENTRIES_PER_BLOCK as u64).min(slot_capacity);

        Ok(VolumeLayout {
            volume_id,
            block_size: PAGE_SIZE as u32,
            total_blocks,
            journal_start,
            journal_size,
            table_start,
            table_blocks,
            data_start,
            max_chunks,
        })
    }

    pub fn encode_into(&self, page: &Page) {
        page.zero();
        page.with_data_mut(|buf| {
            let sb = Superblock {
                magic: VOLUME_MAGIC.to_le(),
                version: VOLUME_VERSION.to_le(),
                block_size: self.block_size.to_le(),
                reserved: 0,
                volume_id: *self.volume_id.as_bytes(),
                total_blocks: self.total_blocks.to_le(),
                journal_start: self.journal_start.to_le(),
                journal_size: self.journal_size.to_le(),
                table_start: self.table_start.to_le(),
                table_blocks: self.table_blocks.to_le(),
                data_start: self.data_start.to_le(),
                max_chunks: self.max_chunks.to_le(),
                hash: [0u8; HASH_SIZE],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sb as *const Superblock as *const u8,
                    buf.as_mut_ptr(),
                    size_of::<Superblock>(),
                );
            }
            let hash = block_hash(&buf[..SB_HASH_OFFSET]);
            buf[SB_HASH_OFFSET..SB_HASH_OFFSET + HASH_SIZE].copy_from_slice(&hash);
        });
    }

    pub fn decode_from(page: &Page) -> Result<VolumeLayout> {
        page.with_data(|buf| {
            let sb: Superblock = unsafe { std::ptr::read(buf.as_ptr() as *const Superblock) };
            if u32::from_le(sb.magic) != VOLUME_MAGIC {
                return Err(Error::BadMagic);
            }
            if block_hash(&buf[..SB_HASH_OFFSET]) != sb.hash {
                return Err(Error::DataCorrupt);
            }
            if u32::from_le(sb.version) != VOLUME_VERSION {
                return Err(Error::InvalidValue);
            }

            let layout = VolumeLayout {
                volume_id: Guid::from_bytes(sb.volume_id),
                block_size: u32::from_le(sb.block_size),
                total_blocks: u64::from_le(sb.total_blocks),
                journal_start: u64::from_le(sb.journal_start),
                journal_size: u64::from_le(sb.journal_size),
                table_start: u64::from_le(sb.table_start),
                table_blocks: u64::from_le(sb.table_blocks),
                data_start: u64::from_le(sb.data_start),
                max_chunks: u64::from_le(sb.max_chunks),
            };
            layout.validate()?;
            Ok(layout)
        })
    }

    /// 几何自洽检查 (不含设备容量, 那由卷在 load 时对照)
    pub fn validate(&self) -> Result<()> {
        if self.block_size as usize != PAGE_SIZE {
            return Err(Error::BadSize);
        }
        if self.journal_start != 1
            || self.journal_size < 2
            || self.table_start != self.journal_start + self.journal_size
            || self.table_blocks == 0
            || self.data_start != self.table_start + self.table_blocks
            || self.data_start + self.max_chunks * CHUNK_BLOCKS > self.total_blocks
        {
            return Err(Error::BadSize);
        }
        Ok(())
    }

    /// 槽号 → 数据区字节偏移
    pub fn slot_position(&self, slot: u64) -> u64 {
        (self.data_start + slot * CHUNK_BLOCKS) * PAGE_SIZE as u64
    }

    /// 槽号 → 所在表块及其字节偏移
    pub fn table_page_of(&self, slot: u64) -> (u64, u64) {
        let page_index = slot / ENTRIES_PER_BLOCK as u64;
        (
            page_index,
            (self.table_start + page_index) * PAGE_SIZE as u64,
        )
    }
}

// ============ chunk 表项 ============

#[repr(C, packed)]
pub struct ChunkEntry {
    pub chunk_id: [u8; GUID_SIZE],
    pub slot: u64,
    /// 载荷 xxHash-64, 0 表示从未写入
    pub data_hash: u64,
    pub data_size: u32,
    pub flags: u32,
    pub reserved: [u8; 24],
}

const _: () = assert!(size_of::<ChunkEntry>() == CHUNK_ENTRY_SIZE);
const _: () = assert!(size_of::<Superblock>() <= PAGE_SIZE);

/// 表项的内存形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub slot: u64,
    pub data_hash: u64,
    pub data_size: u32,
}

/// 把一个表项写进表块缓冲区; None 表示清空该槽位
pub fn write_entry(buf: &mut [u8], index_in_block: usize, id: &Guid, info: Option<&ChunkInfo>) {
    let offset = index_in_block * CHUNK_ENTRY_SIZE;
    let dst = &mut buf[offset..offset + CHUNK_ENTRY_SIZE];
    match info {
        Some(info) => {
            let entry = ChunkEntry {
                chunk_id: *id.as_bytes(),
                slot: info.slot.to_le(),
                data_hash: info.data_hash.to_le(),
                data_size: info.data_size.to_le(),
                flags: CHUNK_ENTRY_USED.to_le(),
                reserved: [0u8; 24],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &entry as *const ChunkEntry as *const u8,
                    dst.as_mut_ptr(),
                    CHUNK_ENTRY_SIZE,
                );
            }
        }
        None => dst.fill(0),
    }
}

/// 读出一个表项; 未占用返回 None
pub fn read_entry(buf: &[u8], index_in_block: usize) -> Option<(Guid, ChunkInfo)> {
    let offset = index_in_block * CHUNK_ENTRY_SIZE;
    let src = &buf[offset..offset + CHUNK_ENTRY_SIZE];
    let entry: ChunkEntry = unsafe { std::ptr::read(src.as_ptr() as *const ChunkEntry) };
    if u32::from_le(entry.flags) & CHUNK_ENTRY_USED == 0 {
        return None;
    }
    Some((
        Guid::from_bytes(entry.chunk_id),
        ChunkInfo {
            slot: u64::from_le(entry.slot),
            data_hash: u64::from_le(entry.data_hash),
            data_size: u32::from_le(entry.data_size),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_compute() {
        // 64 MiB = 16384 块
        let layout = VolumeLayout::compute(16384, Guid::generate()).unwrap();
        assert_eq!(layout.journal_start, 1);
        assert_eq!(layout.journal_size, 2048);
        assert_eq!(layout.table_start, 2049);
        assert!(layout.max_chunks > 0);
        layout.validate().unwrap();
        assert!(layout.data_start + layout.max_chunks * CHUNK_BLOCKS <= layout.total_blocks);
    }

    #[test]
    fn test_layout_too_small() {
        assert!(matches!(
            VolumeLayout::compute(32, Guid::generate()),
            Err(Error::BadSize)
        ));
    }

    #[test]
    fn test_minimum_layout_has_slots() {
        let layout = VolumeLayout::compute(MIN_VOLUME_BLOCKS, Guid::generate()).unwrap();
        assert!(layout.max_chunks >= 1);
        layout.validate().unwrap();
    }

    #[test]
    fn test_superblock_roundtrip() {
        let id = Guid::generate();
        let layout = VolumeLayout::compute(16384, id).unwrap();
        let page = Page::new();
        layout.encode_into(&page);

        let back = VolumeLayout::decode_from(&page).unwrap();
        assert_eq!(back.volume_id, id);
        assert_eq!(back.total_blocks, 16384);
        assert_eq!(back.journal_size, layout.journal_size);
        assert_eq!(back.max_chunks, layout.max_chunks);
    }

    #[test]
    fn test_superblock_corruption() {
        let layout = VolumeLayout::compute(16384, Guid::generate()).unwrap();
        let page = Page::new();
        layout.encode_into(&page);
        page.write(&[0xFF], 20);
        assert!(matches!(
            VolumeLayout::decode_from(&page),
            Err(Error::DataCorrupt)
        ));

        let page = Page::new();
        assert!(matches!(
            VolumeLayout::decode_from(&page),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn test_entry_roundtrip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let id = Guid::generate();
        let info = ChunkInfo {
            slot: 7,
            data_hash: 0xDEAD_BEEF,
            data_size: CHUNK_SIZE as u32,
        };
        write_entry(&mut buf, 7, &id, Some(&info));

        assert!(read_entry(&buf, 6).is_none());
        let (read_id, read_info) = read_entry(&buf, 7).unwrap();
        assert_eq!(read_id, id);
        assert_eq!(read_info, info);

        write_entry(&mut buf, 7, &id, None);
        assert!(read_entry(&buf, 7).is_none());
    }
}
