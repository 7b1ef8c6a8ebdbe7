// Volume: 设备 + journal + chunk 表
//
// 设计原理:
// 1. 元数据 (chunk 表页) 的每次变更先进 journal 事务, 提交成功后
//    再直接写回家位置; 崩溃窗口由下次 Load 的重放兜底
// 2. chunk 载荷不走 journal, 直接按槽位批量写, 带 FLUSH 屏障;
//    表项里记载荷的 xxHash, 读取时校验
// 3. 槽位分配用位图 first-fit, 表项索引即槽号

pub mod types;

use crate::bio::BioList;
use crate::device::{BlockIo, DeviceRef, FileDevice};
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::journal::{Journal, JournalState};
use crate::page::{Page, PageRef, PAGE_SIZE};
use bitvec::prelude::*;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use xxhash_rust::xxh64::xxh64;

use self::types::{
    read_entry, write_entry, ChunkInfo, VolumeLayout, CHUNK_SIZE, ENTRIES_PER_BLOCK,
};

/// 格式化时清零区域的每批 bio 数
const ZERO_BATCH: u64 = 128;

// ============ chunk 表 (内存形式) ============

struct ChunkTable {
    entries: HashMap<Guid, ChunkInfo>,
    /// 槽位占用位图, first-fit 扫描
    slots: BitVec,
    /// 槽号 → 持有者, 重建表页时用
    owners: Vec<Option<Guid>>,
}

impl ChunkTable {
    fn new() -> ChunkTable {
        ChunkTable {
            entries: HashMap::new(),
            slots: BitVec::new(),
            owners: Vec::new(),
        }
    }

    fn reset(&mut self, max_chunks: u64) {
        self.entries.clear();
        self.slots = bitvec![0; max_chunks as usize];
        self.owners = vec![None; max_chunks as usize];
    }

    fn alloc_slot(&mut self) -> Result<u64> {
        for i in 0..self.slots.len() {
            if !self.slots[i] {
                self.slots.set(i, true);
                return Ok(i as u64);
            }
        }
        Err(Error::NoMemory)
    }

    fn insert(&mut self, id: Guid, info: ChunkInfo) {
        self.owners[info.slot as usize] = Some(id);
        self.entries.insert(id, info);
    }

    fn remove(&mut self, id: &Guid) -> Option<ChunkInfo> {
        let info = self.entries.remove(id)?;
        self.slots.set(info.slot as usize, false);
        self.owners[info.slot as usize] = None;
        Some(info)
    }
}

// ============ Volume ============

pub struct Volume {
    device_name: String,
    dev: DeviceRef,
    journal: Arc<Journal>,
    layout: RwLock<Option<VolumeLayout>>,
    table: RwLock<ChunkTable>,
    /// 串行化元数据事务 (创建/写表/删除)
    meta_lock: Mutex<()>,
}

impl Volume {
    /// 打开设备 (读写独占)
    pub fn new(device_name: &str) -> Result<Volume> {
        let dev: DeviceRef = Arc::new(FileDevice::open(device_name)?);
        Ok(Volume::with_device(device_name, dev))
    }

    /// 用外部提供的设备构建 (测试和内存卷)
    pub fn with_device(device_name: &str, dev: DeviceRef) -> Volume {
        let journal = Journal::new(dev.clone());
        Volume {
            device_name: device_name.to_string(),
            dev,
            journal,
            layout: RwLock::new(None),
            table: RwLock::new(ChunkTable::new()),
            meta_lock: Mutex::new(()),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn volume_id(&self) -> Guid {
        self.layout
            .read()
            .unwrap()
            .map(|l| l.volume_id)
            .unwrap_or_else(Guid::zero)
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn layout(&self) -> Result<VolumeLayout> {
        self.layout.read().unwrap().ok_or(Error::InvalidState)
    }

    /// 写超级块、格式化 journal、清空 chunk 表。
    /// 只支持 block_size = 4096。
    pub fn format(&self, block_size: u64) -> Result<()> {
        if block_size != PAGE_SIZE as u64 {
            return Err(Error::InvalidValue);
        }
        if self.journal.state() == JournalState::Running {
            return Err(Error::InvalidState);
        }

        let total_blocks = self.dev.capacity()? / PAGE_SIZE as u64;
        let layout = VolumeLayout::compute(total_blocks, Guid::generate())?;

        // journal 环和表区清零: 全零块天然解码为"空日志"/"空表"
        self.zero_region(layout.journal_start, layout.journal_size)?;
        self.zero_region(layout.table_start, layout.table_blocks)?;

        self.journal.format(layout.journal_start, layout.journal_size)?;

        let page = Page::alloc();
        layout.encode_into(&page);
        let mut list = BioList::new(self.dev.clone());
        list.add_exec(page, 0, true, true)?;

        *self.layout.write().unwrap() = Some(layout);
        self.table.write().unwrap().reset(layout.max_chunks);

        info!(
            "[Volume] {} formatted: id={} blocks={} journal={}+{} table={}+{} chunks={}",
            self.device_name,
            layout.volume_id,
            layout.total_blocks,
            layout.journal_start,
            layout.journal_size,
            layout.table_start,
            layout.table_blocks,
            layout.max_chunks
        );
        Ok(())
    }

    /// 校验超级块、加载并重放 journal、读入 chunk 表。
    pub fn load(&self) -> Result<()> {
        let page = Page::alloc();
        let mut list = BioList::new(self.dev.clone());
        list.add_exec(page.clone(), 0, false, false)?;
        let layout = VolumeLayout::decode_from(&page)?;

        let capacity = self.dev.capacity()?;
        if layout.total_blocks * PAGE_SIZE as u64 > capacity {
            return Err(Error::BadSize);
        }

        *self.layout.write().unwrap() = Some(layout);

        self.journal.load(layout.journal_start)?;
        if self.journal.size() != layout.journal_size {
            warn!(
                "[Volume] {} journal size mismatch: header {} superblock {}",
                self.device_name,
                self.journal.size(),
                layout.journal_size
            );
            self.journal.stop();
            return Err(Error::BadSize);
        }

        self.load_table(&layout)?;

        info!(
            "[Volume] {} loaded: id={} chunks={}/{}",
            self.device_name,
            layout.volume_id,
            self.table.read().unwrap().entries.len(),
            layout.max_chunks
        );
        Ok(())
    }

    /// 停 journal, 刷设备, 释放资源。
    pub fn unmount(&self) -> Result<()> {
        self.journal.stop();
        self.dev.flush()?;
        info!("[Volume] {} unmounted", self.device_name);
        Ok(())
    }

    // ============ chunk 操作 ============

    /// 分配槽位并登记新 chunk
    pub fn chunk_create(&self, id: Guid) -> Result<()> {
        let layout = self.layout()?;
        let _meta = self.meta_lock.lock().unwrap();

        let slot = {
            let mut table = self.table.write().unwrap();
            if table.entries.contains_key(&id) {
                return Err(Error::AlreadyExists);
            }
            let slot = table.alloc_slot()?;
            table.insert(
                id,
                ChunkInfo {
                    slot,
                    data_hash: 0,
                    data_size: 0,
                },
            );
            slot
        };

        match self.commit_table_page(&layout, slot) {
            Ok(()) => {
                debug!("[Volume] chunk {} created at slot {}", id, slot);
                Ok(())
            }
            Err(err) => {
                self.table.write().unwrap().remove(&id);
                Err(err)
            }
        }
    }

    /// 写整个 chunk 载荷 (必须恰好 CHUNK_SIZE 字节)。
    /// 载荷直写槽位, 表项更新走事务。
    pub fn chunk_write(&self, id: Guid, data: &[u8]) -> Result<()> {
        if data.len() != CHUNK_SIZE {
            return Err(Error::InvalidValue);
        }
        let layout = self.layout()?;
        let _meta = self.meta_lock.lock().unwrap();

        let info = {
            let table = self.table.read().unwrap();
            *table.entries.get(&id).ok_or(Error::NotFound)?
        };

        let position = layout.slot_position(info.slot);
        let mut list = BioList::new(self.dev.clone());
        for i in 0..CHUNK_SIZE / PAGE_SIZE {
            let page = Page::alloc();
            page.write(&data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE], 0);
            list.add_io(page, position + (i * PAGE_SIZE) as u64, true)?;
        }
        list.add_flush()?;
        list.exec(true)?;

        let prev = {
            let mut table = self.table.write().unwrap();
            let entry = table.entries.get_mut(&id).ok_or(Error::NotFound)?;
            let prev = *entry;
            entry.data_hash = xxh64(data, 0);
            entry.data_size = data.len() as u32;
            prev
        };

        match self.commit_table_page(&layout, info.slot) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(entry) = self.table.write().unwrap().entries.get_mut(&id) {
                    *entry = prev;
                }
                Err(err)
            }
        }
    }

    /// 读整个 chunk 载荷并校验哈希
    pub fn chunk_read(&self, id: Guid, buf: &mut [u8]) -> Result<()> {
        if buf.len() != CHUNK_SIZE {
            return Err(Error::InvalidValue);
        }
        let layout = self.layout()?;

        let info = {
            let table = self.table.read().unwrap();
            *table.entries.get(&id).ok_or(Error::NotFound)?
        };

        let position = layout.slot_position(info.slot);
        let pages: Vec<PageRef> = (0..CHUNK_SIZE / PAGE_SIZE).map(|_| Page::alloc()).collect();
        let mut list = BioList::new(self.dev.clone());
        for (i, page) in pages.iter().enumerate() {
            list.add_io(page.clone(), position + (i * PAGE_SIZE) as u64, false)?;
        }
        list.exec(true)?;

        for (i, page) in pages.iter().enumerate() {
            page.read(&mut buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE], 0);
        }

        if info.data_hash != 0 && xxh64(buf, 0) != info.data_hash {
            return Err(Error::DataCorrupt);
        }
        Ok(())
    }

    /// 注销 chunk 并释放槽位
    pub fn chunk_delete(&self, id: Guid) -> Result<()> {
        let layout = self.layout()?;
        let _meta = self.meta_lock.lock().unwrap();

        let info = {
            let mut table = self.table.write().unwrap();
            table.remove(&id).ok_or(Error::NotFound)?
        };

        match self.commit_table_page(&layout, info.slot) {
            Ok(()) => {
                debug!("[Volume] chunk {} deleted from slot {}", id, info.slot);
                Ok(())
            }
            Err(err) => {
                let mut table = self.table.write().unwrap();
                table.slots.set(info.slot as usize, true);
                table.insert(id, info);
                Err(err)
            }
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.table.read().unwrap().entries.len()
    }

    // ============ 内部 ============

    /// 把 slot 所在的表页经 journal 事务提交, 成功后写回家位置
    fn commit_table_page(&self, layout: &VolumeLayout, slot: u64) -> Result<()> {
        let (page_index, position) = layout.table_page_of(slot);
        let page = {
            let table = self.table.read().unwrap();
            build_table_page(&table, layout, page_index)
        };

        let tx = self.journal.begin_tx()?;
        if let Err(err) = tx.write(&page, position) {
            tx.cancel();
            return Err(err);
        }
        tx.commit()?;

        // 家位置应用; 崩在这之前由重放补齐
        let mut list = BioList::new(self.dev.clone());
        list.add_exec(page, position, true, true)
    }

    fn load_table(&self, layout: &VolumeLayout) -> Result<()> {
        let mut table = ChunkTable::new();
        table.reset(layout.max_chunks);

        let page = Page::alloc();
        for block in 0..layout.table_blocks {
            let mut list = BioList::new(self.dev.clone());
            list.add_exec(
                page.clone(),
                (layout.table_start + block) * PAGE_SIZE as u64,
                false,
                false,
            )?;

            let parsed: Result<Vec<(Guid, ChunkInfo)>> = page.with_data(|buf| {
                let mut found = Vec::new();
                for i in 0..ENTRIES_PER_BLOCK {
                    let slot = block * ENTRIES_PER_BLOCK as u64 + i as u64;
                    if let Some((id, info)) = read_entry(buf, i) {
                        if slot >= layout.max_chunks || info.slot != slot {
                            return Err(Error::DataCorrupt);
                        }
                        found.push((id, info));
                    }
                }
                Ok(found)
            });

            for (id, info) in parsed? {
                if table.entries.contains_key(&id) {
                    return Err(Error::DataCorrupt);
                }
                table.slots.set(info.slot as usize, true);
                table.insert(id, info);
            }
        }

        *self.table.write().unwrap() = table;
        Ok(())
    }

    fn zero_region(&self, start_block: u64, blocks: u64) -> Result<()> {
        let zero = Page::alloc();
        let mut index = start_block;
        let end = start_block + blocks;
        while index < end {
            let mut list = BioList::new(self.dev.clone());
            let batch_end = (index + ZERO_BATCH).min(end);
            while index < batch_end {
                list.add_io(zero.clone(), index * PAGE_SIZE as u64, true)?;
                index += 1;
            }
            list.exec(true)?;
        }
        Ok(())
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        // 写线程持有 journal 的 Arc, 必须显式停才能回收
        self.journal.stop();
    }
}

/// 按内存表重建一个表块的磁盘映像
fn build_table_page(table: &ChunkTable, layout: &VolumeLayout, page_index: u64) -> PageRef {
    let page = Page::alloc();
    page.with_data_mut(|buf| {
        for i in 0..ENTRIES_PER_BLOCK {
            let slot = page_index * ENTRIES_PER_BLOCK as u64 + i as u64;
            if slot >= layout.max_chunks {
                break;
            }
            let owner = table
                .owners
                .get(slot as usize)
                .and_then(|owner| owner.as_ref());
            match owner {
                Some(id) => match table.entries.get(id) {
                    Some(info) => write_entry(buf, i, id, Some(info)),
                    None => write_entry(buf, i, id, None),
                },
                None => write_entry(buf, i, &Guid::zero(), None),
            }
        }
    });
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::journal::types::JournalHeader;

    const MB: u64 = 1024 * 1024;

    fn mem_volume(size: u64) -> (Arc<MemDevice>, Volume) {
        let mem = Arc::new(MemDevice::new(size));
        let dev: DeviceRef = mem.clone();
        (mem, Volume::with_device("mem0", dev))
    }

    fn formatted_volume(size: u64) -> (Arc<MemDevice>, Volume) {
        let (mem, volume) = mem_volume(size);
        volume.format(PAGE_SIZE as u64).unwrap();
        volume.load().unwrap();
        (mem, volume)
    }

    fn chunk_of(byte: u8) -> Vec<u8> {
        vec![byte; CHUNK_SIZE]
    }

    #[test]
    fn test_format_load_smoke() {
        let (mem, volume) = mem_volume(64 * MB);
        volume.format(PAGE_SIZE as u64).unwrap();
        volume.load().unwrap();

        assert!(!volume.volume_id().is_zero());
        let layout = volume.layout().unwrap();
        assert_eq!(layout.total_blocks, 64 * MB / PAGE_SIZE as u64);

        // journal 头可独立读回验证
        let page = Page::new();
        let mut raw = vec![0u8; PAGE_SIZE];
        mem.read_at(&mut raw, layout.journal_start * PAGE_SIZE as u64)
            .unwrap();
        page.write(&raw, 0);
        assert_eq!(
            JournalHeader::decode_from(&page).unwrap(),
            layout.journal_size
        );
        assert_eq!(
            volume.journal().curr_block_index(),
            volume.journal().start() + 1
        );

        volume.unmount().unwrap();
    }

    #[test]
    fn test_format_rejects_foreign_block_size() {
        let (_, volume) = mem_volume(64 * MB);
        assert!(matches!(volume.format(512), Err(Error::InvalidValue)));
        assert!(matches!(volume.format(8192), Err(Error::InvalidValue)));
    }

    #[test]
    fn test_load_without_format() {
        let (_, volume) = mem_volume(64 * MB);
        assert!(matches!(volume.load(), Err(Error::BadMagic)));
    }

    #[test]
    fn test_chunk_roundtrip() {
        let (_, volume) = formatted_volume(64 * MB);
        let id = Guid::generate();

        volume.chunk_create(id).unwrap();
        assert!(matches!(
            volume.chunk_create(id),
            Err(Error::AlreadyExists)
        ));

        let data = chunk_of(0xA5);
        volume.chunk_write(id, &data).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        volume.chunk_read(id, &mut out).unwrap();
        assert_eq!(out, data);

        volume.chunk_delete(id).unwrap();
        assert!(matches!(
            volume.chunk_read(id, &mut out),
            Err(Error::NotFound)
        ));
        assert!(matches!(volume.chunk_delete(id), Err(Error::NotFound)));

        volume.unmount().unwrap();
    }

    #[test]
    fn test_chunk_size_enforced() {
        let (_, volume) = formatted_volume(64 * MB);
        let id = Guid::generate();
        volume.chunk_create(id).unwrap();

        assert!(matches!(
            volume.chunk_write(id, &[0u8; 100]),
            Err(Error::InvalidValue)
        ));
        let mut short = vec![0u8; 100];
        assert!(matches!(
            volume.chunk_read(id, &mut short),
            Err(Error::InvalidValue)
        ));
        volume.unmount().unwrap();
    }

    #[test]
    fn test_chunk_survives_remount() {
        let (mem, volume) = formatted_volume(64 * MB);
        let id = Guid::generate();
        let data = chunk_of(0x3C);
        volume.chunk_create(id).unwrap();
        volume.chunk_write(id, &data).unwrap();
        volume.unmount().unwrap();

        let dev: DeviceRef = mem.clone();
        let volume2 = Volume::with_device("mem0", dev);
        volume2.load().unwrap();
        assert_eq!(volume2.chunk_count(), 1);

        let mut out = vec![0u8; CHUNK_SIZE];
        volume2.chunk_read(id, &mut out).unwrap();
        assert_eq!(out, data);
        volume2.unmount().unwrap();
    }

    #[test]
    fn test_chunk_survives_crash() {
        let (mem, volume) = formatted_volume(64 * MB);
        let id = Guid::generate();
        let data = chunk_of(0x5E);
        volume.chunk_create(id).unwrap();
        volume.chunk_write(id, &data).unwrap();

        // 掉电: 不 unmount, 直接冻结设备字节
        let crashed: DeviceRef = Arc::new(mem.snapshot());
        let volume2 = Volume::with_device("mem1", crashed);
        volume2.load().unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        volume2.chunk_read(id, &mut out).unwrap();
        assert_eq!(out, data);
        volume2.unmount().unwrap();
        volume.unmount().unwrap();
    }

    #[test]
    fn test_payload_corruption_detected() {
        let (mem, volume) = formatted_volume(64 * MB);
        let id = Guid::generate();
        volume.chunk_create(id).unwrap();
        volume.chunk_write(id, &chunk_of(0x42)).unwrap();

        // 破坏槽内一个字节
        let layout = volume.layout().unwrap();
        let info_pos = {
            let table = volume.table.read().unwrap();
            layout.slot_position(table.entries[&id].slot)
        };
        mem.write_at(&[0x00], info_pos + 17).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        assert!(matches!(
            volume.chunk_read(id, &mut out),
            Err(Error::DataCorrupt)
        ));
        volume.unmount().unwrap();
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let (_, volume) = formatted_volume(64 * MB);
        let a = Guid::generate();
        volume.chunk_create(a).unwrap();
        let slot_a = volume.table.read().unwrap().entries[&a].slot;
        volume.chunk_delete(a).unwrap();

        let b = Guid::generate();
        volume.chunk_create(b).unwrap();
        assert_eq!(volume.table.read().unwrap().entries[&b].slot, slot_a);
        volume.unmount().unwrap();
    }

    #[test]
    fn test_slot_exhaustion() {
        // 最小卷只有少量槽位
        let (_, volume) = formatted_volume(MIN_TEST_SIZE);
        let layout = volume.layout().unwrap();
        for _ in 0..layout.max_chunks {
            volume.chunk_create(Guid::generate()).unwrap();
        }
        assert!(matches!(
            volume.chunk_create(Guid::generate()),
            Err(Error::NoMemory)
        ));
        volume.unmount().unwrap();
    }

    const MIN_TEST_SIZE: u64 = 64 * PAGE_SIZE as u64;

    #[test]
    fn test_concurrent_chunk_writes() {
        let (_, volume) = formatted_volume(64 * MB);
        let volume = Arc::new(volume);

        let ids: Vec<Guid> = (0..10).map(|_| Guid::generate()).collect();
        for id in &ids {
            volume.chunk_create(*id).unwrap();
        }

        let mut handles = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let volume = Arc::clone(&volume);
            let id = *id;
            handles.push(std::thread::spawn(move || {
                volume.chunk_write(id, &chunk_of(i as u8 + 1))
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        for (i, id) in ids.iter().enumerate() {
            let mut out = vec![0u8; CHUNK_SIZE];
            volume.chunk_read(*id, &mut out).unwrap();
            assert_eq!(out, chunk_of(i as u8 + 1));
        }
        volume.unmount().unwrap();
    }
}
