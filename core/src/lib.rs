// ChunkStor core
//
// 块寻址存储卷: 写前日志 + GUID 寻址 chunk 存储 + 控制面。
//
// 依赖顺序 (叶子在前):
//   device  - 块设备抽象 (文件/内存), 独占打开
//   page    - 4096 字节页缓冲
//   bio     - 页级 I/O 批量提交, FUA/FLUSH 屏障
//   journal - 环形写前日志: 事务, 重放, 后台写线程
//   volume  - 设备 + journal + chunk 表, format/load/unmount
//   control - 单卷挂载与命令分发
//   server  - TCP chunk 协议

pub mod bio;
pub mod control;
pub mod device;
pub mod error;
pub mod guid;
pub mod journal;
pub mod page;
pub mod server;
pub mod volume;

pub use bio::{Bio, BioDir, BioList, SECTOR_SIZE};
pub use control::{Request, Response, Service};
pub use device::{BlockIo, DeviceRef, FileDevice, MemDevice};
pub use error::{Error, Result};
pub use guid::{Guid, GUID_SIZE};
pub use journal::{Journal, JournalState, Transaction, TxState};
pub use page::{Page, PageRef, PAGE_SIZE};
pub use server::Client;
pub use volume::types::{VolumeLayout, CHUNK_SIZE};
pub use volume::Volume;
