// 控制面: 单卷挂载 + 命令分发
//
// 进程里只有一个 Service, 入口处构建后显式传递 (Arc)。
// 挂载/卸载拿卷槽的写锁, chunk 操作拿读锁并持有到操作结束,
// 所以卸载会等到在途 chunk 操作全部完成。
// Request/Response 与原生 ioctl 表一一对应, 网络层和 CLI 共用。

use crate::device::DeviceRef;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::server::Server;
use crate::volume::types::CHUNK_SIZE;
use crate::volume::Volume;
use log::{debug, info};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Service {
    volume: RwLock<Option<Arc<Volume>>>,
    server: Mutex<Option<Server>>,
}

#[derive(Debug, Clone)]
pub enum Request {
    GetTime,
    GetRandomUlong,
    Mount {
        device_name: String,
        format: bool,
        block_size: u64,
    },
    UnmountById(Guid),
    UnmountByName(String),
    StartServer {
        host: String,
        port: u16,
    },
    StopServer,
    ChunkCreate(Guid),
    ChunkWrite(Guid, Vec<u8>),
    ChunkRead(Guid),
    ChunkDelete(Guid),
}

#[derive(Debug, Clone)]
pub enum Response {
    Time(u64),
    RandomUlong(u64),
    Mounted(Guid),
    Port(u16),
    Data(Vec<u8>),
    Done,
}

impl Service {
    pub fn new() -> Arc<Service> {
        Arc::new(Service {
            volume: RwLock::new(None),
            server: Mutex::new(None),
        })
    }

    /// 纳秒时间戳
    pub fn get_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default()
    }

    /// 随机 64 位 (复用 GUID 生成器的熵)
    pub fn get_random_u64(&self) -> u64 {
        let bytes = Guid::generate();
        u64::from_le_bytes(bytes.as_bytes()[..8].try_into().unwrap_or_default())
    }

    /// 挂载设备; 已有挂载卷时报 AlreadyExists。
    /// format 为真时先格式化再加载。成功返回卷 GUID。
    pub fn mount(&self, device_name: &str, format: bool, block_size: u64) -> Result<Guid> {
        let mut slot = self.volume.write().unwrap();
        if slot.is_some() {
            return Err(Error::AlreadyExists);
        }
        let volume = Volume::new(device_name)?;
        let id = Self::prepare_volume(&volume, format, block_size)?;
        *slot = Some(Arc::new(volume));
        info!("[Service] mounted {} as {}", device_name, id);
        Ok(id)
    }

    /// 用外部设备挂载 (测试和内存卷)
    pub fn mount_with_device(
        &self,
        device_name: &str,
        dev: DeviceRef,
        format: bool,
        block_size: u64,
    ) -> Result<Guid> {
        let mut slot = self.volume.write().unwrap();
        if slot.is_some() {
            return Err(Error::AlreadyExists);
        }
        let volume = Volume::with_device(device_name, dev);
        let id = Self::prepare_volume(&volume, format, block_size)?;
        *slot = Some(Arc::new(volume));
        info!("[Service] mounted {} as {}", device_name, id);
        Ok(id)
    }

    fn prepare_volume(volume: &Volume, format: bool, block_size: u64) -> Result<Guid> {
        if format {
            volume.format(block_size)?;
        }
        volume.load()?;
        Ok(volume.volume_id())
    }

    pub fn unmount_by_id(&self, volume_id: Guid) -> Result<()> {
        self.unmount_where(|volume| volume.volume_id() == volume_id)
    }

    pub fn unmount_by_name(&self, device_name: &str) -> Result<()> {
        self.unmount_where(|volume| volume.device_name() == device_name)
    }

    fn unmount_where(&self, pred: impl Fn(&Volume) -> bool) -> Result<()> {
        let mut slot = self.volume.write().unwrap();
        if let Some(volume) = slot.take() {
            if pred(&volume) {
                drop(slot);
                info!("[Service] unmounting {}", volume.device_name());
                return volume.unmount();
            }
            *slot = Some(volume);
        }
        Err(Error::NotFound)
    }

    pub fn chunk_create(&self, chunk_id: Guid) -> Result<()> {
        let guard = self.volume.read().unwrap();
        let volume = guard.as_ref().ok_or(Error::NotFound)?;
        volume.chunk_create(chunk_id)
    }

    pub fn chunk_write(&self, chunk_id: Guid, data: &[u8]) -> Result<()> {
        let guard = self.volume.read().unwrap();
        let volume = guard.as_ref().ok_or(Error::NotFound)?;
        volume.chunk_write(chunk_id, data)
    }

    pub fn chunk_read(&self, chunk_id: Guid, buf: &mut [u8]) -> Result<()> {
        let guard = self.volume.read().unwrap();
        let volume = guard.as_ref().ok_or(Error::NotFound)?;
        volume.chunk_read(chunk_id, buf)
    }

    pub fn chunk_delete(&self, chunk_id: Guid) -> Result<()> {
        let guard = self.volume.read().unwrap();
        let volume = guard.as_ref().ok_or(Error::NotFound)?;
        volume.chunk_delete(chunk_id)
    }

    /// 启动 chunk 服务, 返回实际监听端口 (port=0 时由系统分配)
    pub fn start_server(self: &Arc<Self>, host: &str, port: u16) -> Result<u16> {
        let mut server = self.server.lock().unwrap();
        if server.is_some() {
            return Err(Error::AlreadyExists);
        }
        let started = Server::start(Arc::clone(self), host, port)?;
        let bound = started.local_port();
        *server = Some(started);
        Ok(bound)
    }

    /// 停服务; 没有在跑也算成功
    pub fn stop_server(&self) -> Result<()> {
        let server = self.server.lock().unwrap().take();
        if let Some(mut server) = server {
            server.stop();
        }
        Ok(())
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server.lock().unwrap().as_ref().map(|s| s.local_port())
    }

    /// 停服务并卸载当前卷
    pub fn shutdown(&self) {
        let _ = self.stop_server();
        let volume = self.volume.write().unwrap().take();
        if let Some(volume) = volume {
            let _ = volume.unmount();
        }
    }

    /// ioctl 风格的统一入口
    pub fn dispatch(self: &Arc<Self>, request: Request) -> Result<Response> {
        debug!("[Service] dispatch {:?}", request_name(&request));
        match request {
            Request::GetTime => Ok(Response::Time(self.get_time())),
            Request::GetRandomUlong => Ok(Response::RandomUlong(self.get_random_u64())),
            Request::Mount {
                device_name,
                format,
                block_size,
            } => self
                .mount(&device_name, format, block_size)
                .map(Response::Mounted),
            Request::UnmountById(id) => self.unmount_by_id(id).map(|_| Response::Done),
            Request::UnmountByName(name) => self.unmount_by_name(&name).map(|_| Response::Done),
            Request::StartServer { host, port } => {
                self.start_server(&host, port).map(Response::Port)
            }
            Request::StopServer => self.stop_server().map(|_| Response::Done),
            Request::ChunkCreate(id) => self.chunk_create(id).map(|_| Response::Done),
            Request::ChunkWrite(id, data) => {
                self.chunk_write(id, &data).map(|_| Response::Done)
            }
            Request::ChunkRead(id) => {
                let mut buf = vec![0u8; CHUNK_SIZE];
                self.chunk_read(id, &mut buf)?;
                Ok(Response::Data(buf))
            }
            Request::ChunkDelete(id) => self.chunk_delete(id).map(|_| Response::Done),
        }
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::GetTime => "GetTime",
        Request::GetRandomUlong => "GetRandomUlong",
        Request::Mount { .. } => "Mount",
        Request::UnmountById(_) => "UnmountById",
        Request::UnmountByName(_) => "UnmountByName",
        Request::StartServer { .. } => "StartServer",
        Request::StopServer => "StopServer",
        Request::ChunkCreate(_) => "ChunkCreate",
        Request::ChunkWrite(..) => "ChunkWrite",
        Request::ChunkRead(_) => "ChunkRead",
        Request::ChunkDelete(_) => "ChunkDelete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::page::PAGE_SIZE;

    const MB: u64 = 1024 * 1024;

    fn mem_dev(size: u64) -> DeviceRef {
        Arc::new(MemDevice::new(size))
    }

    #[test]
    fn test_mount_unmount_cycle() {
        let service = Service::new();
        let id = service
            .mount_with_device("mem0", mem_dev(64 * MB), true, PAGE_SIZE as u64)
            .unwrap();
        assert!(!id.is_zero());

        // 已有挂载卷
        assert!(matches!(
            service.mount_with_device("mem1", mem_dev(64 * MB), true, PAGE_SIZE as u64),
            Err(Error::AlreadyExists)
        ));

        assert!(matches!(
            service.unmount_by_id(Guid::generate()),
            Err(Error::NotFound)
        ));
        service.unmount_by_id(id).unwrap();
        assert!(matches!(service.unmount_by_id(id), Err(Error::NotFound)));
    }

    #[test]
    fn test_unmount_by_name() {
        let service = Service::new();
        service
            .mount_with_device("mem0", mem_dev(64 * MB), true, PAGE_SIZE as u64)
            .unwrap();
        assert!(matches!(
            service.unmount_by_name("other"),
            Err(Error::NotFound)
        ));
        service.unmount_by_name("mem0").unwrap();
    }

    #[test]
    fn test_failed_mount_leaves_no_volume() {
        let service = Service::new();
        // 设备太小, 格式化失败
        assert!(matches!(
            service.mount_with_device("tiny", mem_dev(16 * PAGE_SIZE as u64), true, PAGE_SIZE as u64),
            Err(Error::BadSize)
        ));
        // 槽位仍然空闲
        service
            .mount_with_device("mem0", mem_dev(64 * MB), true, PAGE_SIZE as u64)
            .unwrap();
        service.unmount_by_name("mem0").unwrap();
    }

    #[test]
    fn test_chunk_ops_need_volume() {
        let service = Service::new();
        let id = Guid::generate();
        assert!(matches!(service.chunk_create(id), Err(Error::NotFound)));
        assert!(matches!(
            service.chunk_write(id, &[0u8; CHUNK_SIZE]),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_chunk_ops_through_service() {
        let service = Service::new();
        service
            .mount_with_device("mem0", mem_dev(64 * MB), true, PAGE_SIZE as u64)
            .unwrap();

        let id = Guid::generate();
        service.chunk_create(id).unwrap();
        service.chunk_write(id, &vec![0x66u8; CHUNK_SIZE]).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        service.chunk_read(id, &mut out).unwrap();
        assert_eq!(out, vec![0x66u8; CHUNK_SIZE]);

        service.chunk_delete(id).unwrap();
        service.shutdown();
    }

    #[test]
    fn test_unmount_waits_for_chunk_ops() {
        let service = Service::new();
        let volume_id = service
            .mount_with_device("mem0", mem_dev(64 * MB), true, PAGE_SIZE as u64)
            .unwrap();

        let ids: Vec<Guid> = (0..4).map(|_| Guid::generate()).collect();
        for id in &ids {
            service.chunk_create(*id).unwrap();
        }

        let mut writers = Vec::new();
        for id in ids {
            let service = Arc::clone(&service);
            writers.push(std::thread::spawn(move || {
                let data = vec![0x7Au8; CHUNK_SIZE];
                let mut results = Vec::new();
                for _ in 0..20 {
                    results.push(service.chunk_write(id, &data));
                }
                results
            }));
        }

        std::thread::sleep(std::time::Duration::from_millis(5));
        service.unmount_by_id(volume_id).unwrap();

        for writer in writers {
            for result in writer.join().unwrap() {
                // 卸载之前成功, 之后 NotFound; 不会有撕裂结果
                assert!(matches!(result, Ok(()) | Err(Error::NotFound)));
            }
        }
    }

    #[test]
    fn test_dispatch_roundtrip() {
        let service = Service::new();
        assert!(matches!(
            service.dispatch(Request::GetTime),
            Ok(Response::Time(t)) if t > 0
        ));
        assert!(matches!(
            service.dispatch(Request::GetRandomUlong),
            Ok(Response::RandomUlong(_))
        ));
        assert!(matches!(
            service.dispatch(Request::ChunkCreate(Guid::generate())),
            Err(Error::NotFound)
        ));
    }
}
