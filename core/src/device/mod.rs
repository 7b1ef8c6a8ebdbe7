// 块设备抽象
//
// BlockIo 是核心与存储介质之间唯一的缝:
// - FileDevice: 文件或裸块设备, flock 独占, 定位读写
// - MemDevice: 内存设备, 测试用; snapshot() 冻结字节模拟掉电

use crate::error::{Error, Result};
use log::{debug, trace};
use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub trait BlockIo: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
    /// 把已写数据刷到介质 (FLUSH 屏障)
    fn flush(&self) -> Result<()>;
    fn capacity(&self) -> Result<u64>;
}

pub type DeviceRef = Arc<dyn BlockIo>;

// ============ 文件/裸设备 ============

pub struct FileDevice {
    file: std::fs::File,
    locked: bool,
}

impl FileDevice {
    /// 读写 + 独占方式打开。独占通过 flock(LOCK_EX|LOCK_NB) 实现,
    /// 已被占用的设备返回 Busy。
    pub fn open(path: impl AsRef<Path>) -> Result<FileDevice> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        debug!("[Device] opened {} exclusively", path.display());
        Ok(FileDevice { file, locked: true })
    }

    /// 只读打开, 不抢独占 (检查工具用)
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(path.as_ref())?;
        Ok(FileDevice {
            file,
            locked: false,
        })
    }
}

impl BlockIo for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        if self.locked {
            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            trace!("[Device] released exclusive claim");
        }
    }
}

// ============ 内存设备 ============

pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new(capacity: u64) -> MemDevice {
        MemDevice {
            data: Mutex::new(vec![0u8; capacity as usize]),
        }
    }

    /// 拷贝当前字节到一个新设备。崩溃测试用:
    /// 丢掉所有内存状态, 在快照上重新 Load。
    pub fn snapshot(&self) -> MemDevice {
        let data = self.data.lock().unwrap();
        MemDevice {
            data: Mutex::new(data.clone()),
        }
    }
}

impl BlockIo for MemDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::InvalidValue)?;
        if end > data.len() {
            return Err(Error::UnexpectedEof);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::InvalidValue)?;
        if end > data.len() {
            return Err(Error::UnexpectedEof);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }
}
