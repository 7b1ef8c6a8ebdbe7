// Page: 固定大小的块缓冲区
//
// 事务和 bio 列表之间共享页面 (Arc<Page>), 所以内容放在 Mutex 里。
// 内核版本里的 map/unmap 在用户态就是一次加锁借用。

use std::sync::{Arc, Mutex};

pub const PAGE_SIZE: usize = 4096;

pub struct Page {
    buf: Mutex<Box<[u8; PAGE_SIZE]>>,
}

pub type PageRef = Arc<Page>;

impl Page {
    pub fn new() -> Page {
        Page {
            buf: Mutex::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// 分配一个共享页面
    pub fn alloc() -> PageRef {
        Arc::new(Page::new())
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE
    }

    pub fn zero(&self) {
        self.fill(0);
    }

    pub fn fill(&self, byte: u8) {
        let mut buf = self.buf.lock().unwrap();
        buf.fill(byte);
    }

    /// 从页面拷出, 返回实际字节数
    pub fn read(&self, dst: &mut [u8], offset: usize) -> usize {
        if offset >= PAGE_SIZE {
            return 0;
        }
        let buf = self.buf.lock().unwrap();
        let len = dst.len().min(PAGE_SIZE - offset);
        dst[..len].copy_from_slice(&buf[offset..offset + len]);
        len
    }

    /// 拷入页面, 返回实际字节数
    pub fn write(&self, src: &[u8], offset: usize) -> usize {
        if offset >= PAGE_SIZE {
            return 0;
        }
        let mut buf = self.buf.lock().unwrap();
        let len = src.len().min(PAGE_SIZE - offset);
        buf[offset..offset + len].copy_from_slice(&src[..len]);
        len
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let buf = self.buf.lock().unwrap();
        f(&buf[..])
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buf = self.buf.lock().unwrap();
        f(&mut buf[..])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(|data| data.to_vec())
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_on_alloc() {
        let page = Page::new();
        assert!(page.with_data(|d| d.iter().all(|&b| b == 0)));
        assert_eq!(page.size(), PAGE_SIZE);
    }

    #[test]
    fn test_read_write() {
        let page = Page::new();
        assert_eq!(page.write(&[0xAB; 16], 100), 16);

        let mut out = [0u8; 16];
        assert_eq!(page.read(&mut out, 100), 16);
        assert_eq!(out, [0xAB; 16]);
    }

    #[test]
    fn test_bounds_clamped() {
        let page = Page::new();
        assert_eq!(page.write(&[1u8; 64], PAGE_SIZE - 32), 32);
        assert_eq!(page.write(&[1u8; 8], PAGE_SIZE), 0);

        let mut out = [0u8; 64];
        assert_eq!(page.read(&mut out, PAGE_SIZE - 32), 32);
        assert_eq!(page.read(&mut out, PAGE_SIZE + 1), 0);
    }

    #[test]
    fn test_fill_and_zero() {
        let page = Page::new();
        page.fill(0xCD);
        assert!(page.with_data(|d| d.iter().all(|&b| b == 0xCD)));
        page.zero();
        assert!(page.with_data(|d| d.iter().all(|&b| b == 0)));
    }
}
