// benchmark.chunkstor - ChunkStor 性能测试工具

use anyhow::{bail, Result};
use chunkstor_core::{DeviceRef, Guid, MemDevice, Page, Volume, CHUNK_SIZE, PAGE_SIZE};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============ 命令行参数 ============

#[derive(Parser)]
#[command(name = "benchmark.chunkstor")]
#[command(about = "Benchmark ChunkStor volume performance", version = "1.0.0")]
struct Args {
    /// Disk image path, or "mem" for an in-memory volume
    target: String,

    /// Test type: all, chunk-write, chunk-read, commit
    #[arg(short, long, default_value = "all")]
    test: String,

    /// Number of operations
    #[arg(short, long, default_value = "100")]
    count: usize,

    /// In-memory volume size in MB (target = "mem")
    #[arg(short, long, default_value = "256")]
    mem_size_mb: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

// ============ 测试结果 ============

#[derive(Debug)]
struct BenchmarkResult {
    name: String,
    ops: usize,
    bytes_per_op: usize,
    elapsed: Duration,
}

impl BenchmarkResult {
    fn ops_per_sec(&self) -> f64 {
        self.ops as f64 / self.elapsed.as_secs_f64()
    }

    fn throughput_mb(&self) -> f64 {
        (self.ops * self.bytes_per_op) as f64 / 1024.0 / 1024.0 / self.elapsed.as_secs_f64()
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!(
        "{}",
        r#"
    ╔═══════════════════════════════════════╗
    ║      ChunkStor Benchmark              ║
    ╚═══════════════════════════════════════╝
    "#
        .bright_cyan()
    );

    let volume = open_volume(&args)?;
    let layout = volume
        .layout()
        .map_err(|e| anyhow::anyhow!("volume has no layout: {}", e))?;

    let count = args.count.min(layout.max_chunks as usize);
    if count < args.count {
        println!(
            "{}",
            format!(
                "⚠️  capped at {} ops (volume holds {} chunks)",
                count, layout.max_chunks
            )
            .yellow()
        );
    }
    if count == 0 {
        bail!("Volume has no chunk capacity");
    }

    let mut results = Vec::new();
    let run_all = args.test == "all";

    // chunk-read 依赖 chunk-write 准备的数据
    let ids: Vec<Guid> = (0..count).map(|_| Guid::generate()).collect();

    if run_all || args.test == "chunk-write" {
        results.push(bench_chunk_write(&volume, &ids)?);
    }
    if run_all || args.test == "chunk-read" {
        if !(run_all || args.test == "chunk-write") {
            prepare_chunks(&volume, &ids)?;
        }
        results.push(bench_chunk_read(&volume, &ids)?);
    }
    if run_all || args.test == "commit" {
        results.push(bench_commit(&volume, &layout, args.count)?);
    }

    if results.is_empty() {
        bail!("Unknown test type: {}", args.test);
    }

    volume
        .unmount()
        .map_err(|e| anyhow::anyhow!("unmount failed: {}", e))?;

    print_results(&results, args.verbose);
    Ok(())
}

// ============ 环境准备 ============

fn open_volume(args: &Args) -> Result<Volume> {
    let volume = if args.target == "mem" {
        let dev: DeviceRef = Arc::new(MemDevice::new(args.mem_size_mb * 1024 * 1024));
        Volume::with_device("mem", dev)
    } else {
        println!("{}", format!("⚠️  this reformats {}", args.target).yellow());
        Volume::new(&args.target)
            .map_err(|e| anyhow::anyhow!("can't open {}: {}", args.target, e))?
    };

    volume
        .format(PAGE_SIZE as u64)
        .map_err(|e| anyhow::anyhow!("format failed: {}", e))?;
    volume
        .load()
        .map_err(|e| anyhow::anyhow!("load failed: {}", e))?;
    Ok(volume)
}

fn progress(len: usize, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓▒░ "),
    );
    pb.set_message(message);
    pb
}

fn prepare_chunks(volume: &Volume, ids: &[Guid]) -> Result<()> {
    let data = vec![0x55u8; CHUNK_SIZE];
    for id in ids {
        volume
            .chunk_create(*id)
            .map_err(|e| anyhow::anyhow!("create failed: {}", e))?;
        volume
            .chunk_write(*id, &data)
            .map_err(|e| anyhow::anyhow!("write failed: {}", e))?;
    }
    Ok(())
}

// ============ 测试项 ============

fn bench_chunk_write(volume: &Volume, ids: &[Guid]) -> Result<BenchmarkResult> {
    for id in ids {
        volume
            .chunk_create(*id)
            .map_err(|e| anyhow::anyhow!("create failed: {}", e))?;
    }

    let pb = progress(ids.len(), "chunk write...");
    let data = vec![0xA7u8; CHUNK_SIZE];
    let start = Instant::now();
    for id in ids {
        volume
            .chunk_write(*id, &data)
            .map_err(|e| anyhow::anyhow!("write failed: {}", e))?;
        pb.inc(1);
    }
    let elapsed = start.elapsed();
    pb.finish_and_clear();

    Ok(BenchmarkResult {
        name: "chunk-write".to_string(),
        ops: ids.len(),
        bytes_per_op: CHUNK_SIZE,
        elapsed,
    })
}

fn bench_chunk_read(volume: &Volume, ids: &[Guid]) -> Result<BenchmarkResult> {
    let pb = progress(ids.len(), "chunk read...");
    let mut buf = vec![0u8; CHUNK_SIZE];
    let start = Instant::now();
    for id in ids {
        volume
            .chunk_read(*id, &mut buf)
            .map_err(|e| anyhow::anyhow!("read failed: {}", e))?;
        pb.inc(1);
    }
    let elapsed = start.elapsed();
    pb.finish_and_clear();

    Ok(BenchmarkResult {
        name: "chunk-read".to_string(),
        ops: ids.len(),
        bytes_per_op: CHUNK_SIZE,
        elapsed,
    })
}

/// 裸事务提交速率: 每个事务登记一页再提交
fn bench_commit(
    volume: &Volume,
    layout: &chunkstor_core::VolumeLayout,
    count: usize,
) -> Result<BenchmarkResult> {
    let journal = volume.journal();
    // 用第一个槽位当靶子, 避免越过数据区
    let target = layout.slot_position(0);

    let pb = progress(count, "tx commit...");
    let page = Page::new();
    page.fill(0x42);
    let start = Instant::now();
    for _ in 0..count {
        let tx = journal
            .begin_tx()
            .map_err(|e| anyhow::anyhow!("begin_tx failed: {}", e))?;
        tx.write(&page, target)
            .map_err(|e| anyhow::anyhow!("tx write failed: {}", e))?;
        tx.commit()
            .map_err(|e| anyhow::anyhow!("commit failed: {}", e))?;
        pb.inc(1);
    }
    let elapsed = start.elapsed();
    pb.finish_and_clear();

    Ok(BenchmarkResult {
        name: "commit".to_string(),
        ops: count,
        bytes_per_op: PAGE_SIZE,
        elapsed,
    })
}

// ============ 结果输出 ============

fn print_results(results: &[BenchmarkResult], verbose: bool) {
    println!("\n{}", "Results".bright_green().bold());
    println!(
        "{:<14} {:>8} {:>12} {:>12} {:>12}",
        "test".bold(),
        "ops".bold(),
        "elapsed".bold(),
        "ops/s".bold(),
        "MB/s".bold()
    );
    for result in results {
        println!(
            "{:<14} {:>8} {:>10.2}ms {:>12.0} {:>12.2}",
            result.name.bright_cyan(),
            result.ops,
            result.elapsed.as_secs_f64() * 1000.0,
            result.ops_per_sec(),
            result.throughput_mb()
        );
        if verbose {
            println!("{:#?}", result);
        }
    }
}
