// chunkctl - ChunkStor 控制 CLI
//
// mount/umount 校验并干净地开合一个卷; serve 挂载后跑 chunk 服务
// 直到 SIGINT; test 跑自检场景。退出码 0 成功, 否则错误编码。

use chunkstor_core::{
    Client, Error, Guid, MemDevice, Service, Volume, CHUNK_SIZE, PAGE_SIZE,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============ 命令行参数 ============

#[derive(Parser)]
#[command(name = "chunkctl")]
#[command(about = "ChunkStor control CLI", version = "1.0.0")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a volume (prints its GUID), then shut it down cleanly
    Mount {
        /// Device or image path
        device: String,
        /// Format before mounting
        #[arg(short, long)]
        format: bool,
    },
    /// Replay the journal and shut the volume down cleanly
    Umount {
        device: String,
    },
    /// Mount a volume and run the chunk server until interrupted
    Serve {
        device: String,
        host: String,
        port: u16,
    },
    /// Run a self-test (1 = chunk round-trip, 2 = crash replay, 3 = concurrency)
    Test {
        device: String,
        test_id: u32,
    },
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let outcome = match args.command {
        Command::Mount { device, format } => cmd_mount(&device, format),
        Command::Umount { device } => cmd_umount(&device),
        Command::Serve { device, host, port } => cmd_serve(&device, &host, port),
        Command::Test { device, test_id } => cmd_test(&device, test_id),
    };

    match outcome {
        Ok(()) => exit(0),
        Err(err) => {
            eprintln!("{} {}", "chunkctl:".bright_red(), err);
            exit(err.code() as i32);
        }
    }
}

// ============ 子命令 ============

fn cmd_mount(device: &str, format: bool) -> std::result::Result<(), Error> {
    let service = Service::new();
    let volume_id = service.mount(device, format, PAGE_SIZE as u64)?;
    println!("{}", volume_id);
    service.unmount_by_name(device)?;
    Ok(())
}

fn cmd_umount(device: &str) -> std::result::Result<(), Error> {
    let service = Service::new();
    service.mount(device, false, PAGE_SIZE as u64)?;
    service.unmount_by_name(device)?;
    println!("{} {}", device, "clean".bright_green());
    Ok(())
}

fn cmd_serve(device: &str, host: &str, port: u16) -> std::result::Result<(), Error> {
    let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    let service = Service::new();
    let volume_id = service.mount(device, false, PAGE_SIZE as u64)?;
    let bound = service.start_server(host, port)?;
    ping_server(host, bound)?;
    println!(
        "serving volume {} on {}:{} (ctrl-c to stop)",
        volume_id.to_string().bright_cyan(),
        host,
        bound
    );

    while !INTERRUPTED.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("\nshutting down...");
    service.shutdown();
    Ok(())
}

fn cmd_test(device: &str, test_id: u32) -> std::result::Result<(), Error> {
    match test_id {
        1 => test_chunk_roundtrip(device),
        2 => test_crash_replay(),
        3 => test_concurrency(device),
        _ => Err(Error::InvalidValue),
    }
}

// ============ 自检场景 ============

/// chunk 创建/写/读/删一个来回
fn test_chunk_roundtrip(device: &str) -> std::result::Result<(), Error> {
    let service = Service::new();
    service.mount(device, false, PAGE_SIZE as u64)?;

    let id = Guid::generate();
    let data = vec![0xA5u8; CHUNK_SIZE];
    service.chunk_create(id)?;
    service.chunk_write(id, &data)?;

    let mut out = vec![0u8; CHUNK_SIZE];
    service.chunk_read(id, &mut out)?;
    if out != data {
        service.shutdown();
        return Err(Error::DataCorrupt);
    }
    service.chunk_delete(id)?;
    service.shutdown();
    println!("{}", "test 1: chunk round-trip ok".bright_green());
    Ok(())
}

/// 内存卷上模拟掉电: 提交后冻结字节, 重新加载验证重放
fn test_crash_replay() -> std::result::Result<(), Error> {
    let mem = Arc::new(MemDevice::new(64 * 1024 * 1024));
    let volume = Volume::with_device("memtest", mem.clone());
    volume.format(PAGE_SIZE as u64)?;
    volume.load()?;

    let id = Guid::generate();
    let data = vec![0x5Eu8; CHUNK_SIZE];
    volume.chunk_create(id)?;
    volume.chunk_write(id, &data)?;

    // 不 unmount, 直接冻结
    let crashed = Arc::new(mem.snapshot());
    let volume2 = Volume::with_device("memtest2", crashed);
    volume2.load()?;

    let mut out = vec![0u8; CHUNK_SIZE];
    volume2.chunk_read(id, &mut out)?;
    volume2.unmount()?;
    volume.unmount()?;
    if out != data {
        return Err(Error::DataCorrupt);
    }
    println!("{}", "test 2: crash replay ok".bright_green());
    Ok(())
}

/// 并发写不同 chunk, 全部成功且能读回
fn test_concurrency(device: &str) -> std::result::Result<(), Error> {
    let service = Service::new();
    service.mount(device, false, PAGE_SIZE as u64)?;

    let ids: Vec<Guid> = (0..8).map(|_| Guid::generate()).collect();
    for id in &ids {
        service.chunk_create(*id)?;
    }

    let mut handles = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let service = Arc::clone(&service);
        let id = *id;
        handles.push(std::thread::spawn(move || {
            service.chunk_write(id, &vec![i as u8 + 1; CHUNK_SIZE])
        }));
    }
    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => {
                service.shutdown();
                return Err(Error::NotExecuted);
            }
        }
    }

    for (i, id) in ids.iter().enumerate() {
        let mut out = vec![0u8; CHUNK_SIZE];
        service.chunk_read(*id, &mut out)?;
        if out != vec![i as u8 + 1; CHUNK_SIZE] {
            service.shutdown();
            return Err(Error::DataCorrupt);
        }
    }

    for id in &ids {
        service.chunk_delete(*id)?;
    }
    service.shutdown();
    println!("{}", "test 3: concurrency ok".bright_green());
    Ok(())
}

/// 起服后的自我握手
fn ping_server(host: &str, port: u16) -> std::result::Result<(), Error> {
    let mut client = Client::connect(host, port)?;
    let reply = client.ping(b"chunkctl")?;
    if reply != b"chunkctl" {
        return Err(Error::DataCorrupt);
    }
    Ok(())
}
