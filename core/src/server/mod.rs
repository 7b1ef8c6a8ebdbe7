// TCP chunk 服务
//
// accept 线程用非阻塞 + 10ms 轮询, 停止标志随时可见 (跟 journal
// 写线程一个路数)。每个连接一个处理线程, 读超时让它们也能看到
// 停止标志。Client 是配套的阻塞客户端, 工具和测试用。

pub mod types;

use crate::control::Service;
use crate::error::{Error, Result};
use crate::guid::{Guid, GUID_SIZE};
use crate::volume::types::CHUNK_SIZE;
use log::{debug, info, trace, warn};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use self::types::{
    read_packet, write_packet, PACKET_TYPE_CHUNK_DELETE, PACKET_TYPE_CHUNK_READ,
    PACKET_TYPE_CHUNK_WRITE, PACKET_TYPE_PING,
};

const ACCEPT_WAIT: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Server {
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    local_port: u16,
}

impl Server {
    pub fn start(service: Arc<Service>, host: &str, port: u16) -> Result<Server> {
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();

        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let accept_thread = std::thread::Builder::new()
            .name("chunk-server".into())
            .spawn(move || accept_loop(service, listener, accept_stop))
            .map_err(Error::from)?;

        info!("[Server] listening on {}:{}", host, local_port);
        Ok(Server {
            stop,
            accept_thread: Some(accept_thread),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                warn!("[Server] accept thread panicked");
            }
        }
        info!("[Server] stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(service: Arc<Service>, listener: TcpListener, stop: Arc<AtomicBool>) {
    let mut handlers: Vec<JoinHandle<()>> = Vec::new();

    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("[Server] connection from {}", peer);
                let service = Arc::clone(&service);
                let stop = Arc::clone(&stop);
                match std::thread::Builder::new()
                    .name("chunk-conn".into())
                    .spawn(move || handle_connection(service, stream, stop))
                {
                    Ok(handle) => handlers.push(handle),
                    Err(err) => warn!("[Server] can't spawn handler: {}", err),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_WAIT);
            }
            Err(err) => {
                warn!("[Server] accept error: {}", err);
                std::thread::sleep(ACCEPT_WAIT);
            }
        }
        handlers.retain(|handle| !handle.is_finished());
    }

    for handle in handlers {
        let _ = handle.join();
    }
}

fn handle_connection(service: Arc<Service>, mut stream: TcpStream, stop: Arc<AtomicBool>) {
    if stream.set_nonblocking(false).is_err() || stream.set_read_timeout(Some(READ_TIMEOUT)).is_err()
    {
        return;
    }

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let (header, body) = match read_packet(&mut stream) {
            Ok(packet) => packet,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                debug!("[Server] dropping connection: {}", err);
                break;
            }
        };

        let (result, response) = process_packet(&service, header.packet_type, &body);
        trace!(
            "[Server] packet type {} result {}",
            header.packet_type,
            result
        );
        if let Err(err) = write_packet(&mut stream, header.packet_type, result, &response) {
            debug!("[Server] write failed: {}", err);
            break;
        }
    }
}

/// 处理一个请求包, 返回 (结果码, 应答 body)
fn process_packet(service: &Arc<Service>, packet_type: u32, body: &[u8]) -> (u32, Vec<u8>) {
    match packet_type {
        PACKET_TYPE_PING => (0, body.to_vec()),
        PACKET_TYPE_CHUNK_WRITE => {
            if body.len() != GUID_SIZE + CHUNK_SIZE {
                return (Error::InvalidValue.code(), Vec::new());
            }
            let Some(chunk_id) = Guid::from_slice(&body[..GUID_SIZE]) else {
                return (Error::InvalidValue.code(), Vec::new());
            };
            // 线上协议没有单独的 create 包: 不存在就先建
            match service.chunk_create(chunk_id) {
                Ok(()) | Err(Error::AlreadyExists) => {}
                Err(err) => return (err.code(), Vec::new()),
            }
            match service.chunk_write(chunk_id, &body[GUID_SIZE..]) {
                Ok(()) => (0, Vec::new()),
                Err(err) => (err.code(), Vec::new()),
            }
        }
        PACKET_TYPE_CHUNK_READ => {
            if body.len() != GUID_SIZE {
                return (Error::InvalidValue.code(), Vec::new());
            }
            let Some(chunk_id) = Guid::from_slice(body) else {
                return (Error::InvalidValue.code(), Vec::new());
            };
            let mut data = vec![0u8; CHUNK_SIZE];
            match service.chunk_read(chunk_id, &mut data) {
                Ok(()) => (0, data),
                Err(err) => (err.code(), Vec::new()),
            }
        }
        PACKET_TYPE_CHUNK_DELETE => {
            if body.len() != GUID_SIZE {
                return (Error::InvalidValue.code(), Vec::new());
            }
            let Some(chunk_id) = Guid::from_slice(body) else {
                return (Error::InvalidValue.code(), Vec::new());
            };
            match service.chunk_delete(chunk_id) {
                Ok(()) => (0, Vec::new()),
                Err(err) => (err.code(), Vec::new()),
            }
        }
        _ => (Error::UnknownCode.code(), Vec::new()),
    }
}

// ============ 阻塞客户端 ============

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(host: &str, port: u16) -> Result<Client> {
        let stream = TcpStream::connect((host, port))?;
        Ok(Client { stream })
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.roundtrip(PACKET_TYPE_PING, payload.to_vec())
    }

    pub fn chunk_write(&mut self, chunk_id: Guid, data: &[u8]) -> Result<()> {
        if data.len() != CHUNK_SIZE {
            return Err(Error::InvalidValue);
        }
        let mut body = Vec::with_capacity(GUID_SIZE + CHUNK_SIZE);
        body.extend_from_slice(chunk_id.as_bytes());
        body.extend_from_slice(data);
        self.roundtrip(PACKET_TYPE_CHUNK_WRITE, body)?;
        Ok(())
    }

    pub fn chunk_read(&mut self, chunk_id: Guid) -> Result<Vec<u8>> {
        let data = self.roundtrip(PACKET_TYPE_CHUNK_READ, chunk_id.as_bytes().to_vec())?;
        if data.len() != CHUNK_SIZE {
            return Err(Error::UnexpectedEof);
        }
        Ok(data)
    }

    pub fn chunk_delete(&mut self, chunk_id: Guid) -> Result<()> {
        self.roundtrip(PACKET_TYPE_CHUNK_DELETE, chunk_id.as_bytes().to_vec())?;
        Ok(())
    }

    fn roundtrip(&mut self, packet_type: u32, body: Vec<u8>) -> Result<Vec<u8>> {
        write_packet(&mut self.stream, packet_type, 0, &body)?;
        let (header, response) = read_packet(&mut self.stream)?;
        if header.packet_type != packet_type {
            return Err(Error::InvalidValue);
        }
        if header.result != 0 {
            return Err(Error::from_code(header.result));
        }
        Ok(response)
    }
}
