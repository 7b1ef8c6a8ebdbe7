// Bio 与 BioList: 批量页级 I/O
//
// Bio 绑定一个设备、一个方向、一个起始扇区和 1..N 个页面,
// 可附带 FUA/FLUSH 屏障。BioList 把多个 bio 聚成一次提交-等待,
// 错误聚合到第一个失败。用户态下定位 I/O 在提交时同步完成,
// wait() 返回已存下的结果。

use crate::device::{BlockIo, DeviceRef};
use crate::error::{Error, Result};
use crate::page::{PageRef, PAGE_SIZE};
use std::sync::Mutex;

pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioDir {
    Read,
    Write,
}

struct BioPage {
    page: PageRef,
    offset: usize,
    len: usize,
}

pub struct Bio {
    dev: Option<DeviceRef>,
    dir: BioDir,
    sector: u64,
    pages: Vec<Option<BioPage>>,
    fua: bool,
    flush: bool,
    result: Mutex<Option<Result<()>>>,
}

impl Bio {
    pub fn new(page_count: usize) -> Result<Bio> {
        if page_count == 0 {
            return Err(Error::InvalidValue);
        }
        let mut pages = Vec::new();
        pages.resize_with(page_count, || None);
        Ok(Bio {
            dev: None,
            dir: BioDir::Read,
            sector: 0,
            pages,
            fua: false,
            flush: false,
            result: Mutex::new(None),
        })
    }

    pub fn set_device(&mut self, dev: DeviceRef) {
        self.dev = Some(dev);
    }

    pub fn set_dir(&mut self, dir: BioDir) {
        self.dir = dir;
    }

    pub fn set_fua(&mut self) {
        self.fua = true;
    }

    pub fn set_flush(&mut self) {
        self.flush = true;
    }

    /// 起始位置, 扇区为单位
    pub fn set_position(&mut self, sector: u64) {
        self.sector = sector;
    }

    pub fn set_page(&mut self, index: usize, page: PageRef, offset: usize, len: usize) -> Result<()> {
        if index >= self.pages.len() || len == 0 || offset + len > PAGE_SIZE {
            return Err(Error::InvalidValue);
        }
        self.pages[index] = Some(BioPage { page, offset, len });
        Ok(())
    }

    pub fn submit(&self) {
        let outcome = self.run();
        *self.result.lock().unwrap() = Some(outcome);
    }

    /// 等待完成并返回结果; 未提交过返回 NotExecuted
    pub fn wait(&self) -> Result<()> {
        self.result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Err(Error::NotExecuted))
    }

    pub fn error(&self) -> Option<Error> {
        match self.result.lock().unwrap().as_ref() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    fn run(&self) -> Result<()> {
        let dev = self.dev.as_ref().ok_or(Error::InvalidState)?;
        let mut offset = self
            .sector
            .checked_mul(SECTOR_SIZE)
            .ok_or(Error::InvalidValue)?;

        for slot in &self.pages {
            let bp = slot.as_ref().ok_or(Error::InvalidValue)?;
            match self.dir {
                BioDir::Read => bp.page.with_data_mut(|data| {
                    dev.read_at(&mut data[bp.offset..bp.offset + bp.len], offset)
                })?,
                BioDir::Write => bp
                    .page
                    .with_data(|data| dev.write_at(&data[bp.offset..bp.offset + bp.len], offset))?,
            }
            offset += bp.len as u64;
        }

        if self.fua || self.flush {
            dev.flush()?;
        }
        Ok(())
    }
}

// ============ BioList ============

pub struct BioList {
    dev: DeviceRef,
    bios: Vec<Bio>,
}

impl BioList {
    pub fn new(dev: DeviceRef) -> BioList {
        BioList {
            dev,
            bios: Vec::new(),
        }
    }

    /// 追加一个单页 bio; byte_offset 必须块对齐
    pub fn add_io(&mut self, page: PageRef, byte_offset: u64, write: bool) -> Result<()> {
        if byte_offset % PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidValue);
        }
        let mut bio = Bio::new(1)?;
        bio.set_device(self.dev.clone());
        bio.set_dir(if write { BioDir::Write } else { BioDir::Read });
        bio.set_position(byte_offset / SECTOR_SIZE);
        bio.set_page(0, page, 0, PAGE_SIZE)?;
        self.bios.push(bio);
        Ok(())
    }

    /// 把末尾 bio 标成 FUA+FLUSH, 作为整串的持久化屏障
    pub fn add_flush(&mut self) -> Result<()> {
        match self.bios.last_mut() {
            Some(bio) => {
                bio.set_fua();
                bio.set_flush();
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    /// 单页同步读写的便捷入口
    pub fn add_exec(&mut self, page: PageRef, byte_offset: u64, write: bool, flush: bool) -> Result<()> {
        self.add_io(page, byte_offset, write)?;
        if flush {
            self.add_flush()?;
        }
        self.exec(true)
    }

    /// 提交全部 bio; wait 时返回第一个失败
    pub fn exec(&mut self, wait: bool) -> Result<()> {
        for bio in &self.bios {
            bio.submit();
        }
        if !wait {
            return Ok(());
        }
        for bio in &self.bios {
            bio.wait()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bios.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::page::Page;
    use std::sync::Arc;

    fn mem_dev(blocks: u64) -> DeviceRef {
        Arc::new(MemDevice::new(blocks * PAGE_SIZE as u64))
    }

    #[test]
    fn test_bio_needs_pages() {
        assert!(matches!(Bio::new(0), Err(Error::InvalidValue)));
    }

    #[test]
    fn test_bio_not_executed() {
        let bio = Bio::new(1).unwrap();
        assert!(matches!(bio.wait(), Err(Error::NotExecuted)));
    }

    #[test]
    fn test_write_then_read() {
        let dev = mem_dev(4);

        let page = Page::alloc();
        page.fill(0xAB);
        let mut list = BioList::new(dev.clone());
        list.add_exec(page, PAGE_SIZE as u64, true, true).unwrap();

        let out = Page::alloc();
        let mut list = BioList::new(dev);
        list.add_exec(out.clone(), PAGE_SIZE as u64, false, false)
            .unwrap();
        assert!(out.with_data(|d| d.iter().all(|&b| b == 0xAB)));
    }

    #[test]
    fn test_unaligned_offset_rejected() {
        let dev = mem_dev(4);
        let mut list = BioList::new(dev);
        assert!(matches!(
            list.add_io(Page::alloc(), 123, true),
            Err(Error::InvalidValue)
        ));
    }

    #[test]
    fn test_error_aggregation() {
        let dev = mem_dev(2);
        let mut list = BioList::new(dev);
        list.add_io(Page::alloc(), 0, true).unwrap();
        // 越过设备末尾
        list.add_io(Page::alloc(), 4 * PAGE_SIZE as u64, true).unwrap();
        assert!(matches!(list.exec(true), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn test_multi_page_bio() {
        let dev = mem_dev(8);
        let a = Page::alloc();
        let b = Page::alloc();
        a.fill(0x11);
        b.fill(0x22);

        let mut bio = Bio::new(2).unwrap();
        bio.set_device(dev.clone());
        bio.set_dir(BioDir::Write);
        bio.set_position(0);
        bio.set_page(0, a, 0, PAGE_SIZE).unwrap();
        bio.set_page(1, b, 0, PAGE_SIZE).unwrap();
        bio.submit();
        bio.wait().unwrap();

        let out = Page::alloc();
        let mut list = BioList::new(dev);
        list.add_exec(out.clone(), PAGE_SIZE as u64, false, false)
            .unwrap();
        assert!(out.with_data(|d| d.iter().all(|&b| b == 0x22)));
    }
}
