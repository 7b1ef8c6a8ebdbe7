// mkvol.chunkstor - ChunkStor 卷格式化工具

use anyhow::{bail, Context, Result};
use chunkstor_core::{Volume, CHUNK_SIZE, PAGE_SIZE};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::io::Write;

// ============ 命令行参数 ============

#[derive(Parser)]
#[command(name = "mkvol.chunkstor")]
#[command(about = "Create a ChunkStor volume", version = "1.0.0")]
struct Args {
    /// Disk image path
    image: String,

    /// Size (e.g., 128M, 1G); omit to keep the existing file size
    #[arg(short, long)]
    size: Option<String>,

    /// Block size (default: 4096)
    #[arg(short, long, default_value = "4096")]
    block_size: u64,

    /// Force overwrite without confirmation
    #[arg(short, long)]
    force: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

// ============ 主函数 ============

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    print_banner();

    let size = match &args.size {
        Some(text) => Some(parse_size(text).context("Invalid size format")?),
        None => None,
    };

    if args.block_size != PAGE_SIZE as u64 {
        bail!("Only {} byte block size is supported", PAGE_SIZE);
    }
    if let Some(size) = size {
        if size < 1024 * 1024 {
            bail!("Volume size must be at least 1M");
        }
        if size % PAGE_SIZE as u64 != 0 {
            bail!("Volume size must be a multiple of the block size");
        }
    }

    println!("📁 Target: {}", args.image.bright_yellow());
    if let Some(size) = size {
        println!(
            "💾 Size: {} MB",
            (size / 1024 / 1024).to_string().bright_green()
        );
    }
    println!(
        "🔢 Block Size: {} bytes\n",
        args.block_size.to_string().bright_green()
    );

    if !args.force {
        print!("This will destroy all data on {}. Continue? [y/N] ", args.image);
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim().to_lowercase() != "y" {
            println!("{}", "❌ Aborted".red());
            return Ok(());
        }
    }

    let pb = ProgressBar::new(4);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓▒░ "),
    );

    pb.set_message("Preparing disk image...");
    prepare_image(&args.image, size)?;
    pb.inc(1);

    pb.set_message("Formatting volume...");
    let volume = Volume::new(&args.image)
        .map_err(|e| anyhow::anyhow!("Can't open {}: {}", args.image, e))?;
    volume
        .format(args.block_size)
        .map_err(|e| anyhow::anyhow!("Format failed: {}", e))?;
    pb.inc(1);

    pb.set_message("Verifying...");
    volume
        .load()
        .map_err(|e| anyhow::anyhow!("Verification load failed: {}", e))?;
    let layout = volume
        .layout()
        .map_err(|e| anyhow::anyhow!("Layout missing after load: {}", e))?;
    pb.inc(1);

    pb.set_message("Flushing...");
    volume
        .unmount()
        .map_err(|e| anyhow::anyhow!("Unmount failed: {}", e))?;
    pb.inc(1);
    pb.finish_with_message("✅ Done!");

    if args.verbose {
        println!("\n{:#?}", layout);
    }

    println!(
        "\n{}",
        "✅ Volume created successfully!".bright_green().bold()
    );
    println!("  Volume ID:    {}", layout.volume_id.to_string().bright_cyan());
    println!(
        "  Total blocks: {} ({} MB)",
        layout.total_blocks,
        layout.total_blocks * PAGE_SIZE as u64 / 1024 / 1024
    );
    println!(
        "  Journal:      blocks {}..{}",
        layout.journal_start,
        layout.journal_start + layout.journal_size
    );
    println!(
        "  Chunk table:  blocks {}..{}",
        layout.table_start,
        layout.table_start + layout.table_blocks
    );
    println!(
        "  Capacity:     {} chunks × {} KB",
        layout.max_chunks.to_string().bright_green(),
        CHUNK_SIZE / 1024
    );
    println!(
        "\nMount with:\n  {} {} {}",
        "chunkctl".bright_cyan(),
        "mount".bright_cyan(),
        args.image.bright_yellow()
    );

    Ok(())
}

// ============ 辅助函数 ============

fn print_banner() {
    println!(
        "{}",
        r#"
    ╔═══════════════════════════════════════╗
    ║      ChunkStor Volume Formatter       ║
    ╚═══════════════════════════════════════╝
    "#
        .bright_cyan()
    );
}

fn parse_size(text: &str) -> Result<u64> {
    let text = text.to_uppercase();
    if let Some(num) = text.strip_suffix('G') {
        Ok(num.parse::<u64>()? * 1024 * 1024 * 1024)
    } else if let Some(num) = text.strip_suffix('M') {
        Ok(num.parse::<u64>()? * 1024 * 1024)
    } else if let Some(num) = text.strip_suffix('K') {
        Ok(num.parse::<u64>()? * 1024)
    } else {
        Ok(text.parse::<u64>()?)
    }
}

fn prepare_image(path: &str, size: Option<u64>) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .context("Failed to open disk image")?;

    if let Some(size) = size {
        file.set_len(size).context("Failed to set image size")?;
    } else if file.metadata()?.len() == 0 {
        bail!("Image is empty; pass --size to allocate it");
    }
    file.sync_all()?;
    Ok(())
}
