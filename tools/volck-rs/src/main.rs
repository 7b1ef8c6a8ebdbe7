// volck.chunkstor - ChunkStor 卷检查工具
//
// 只读检查: 超级块、journal 头、环区普查、chunk 表一致性。
// 退出码: 0 干净, 1 发现问题, 2 无法检查。

use anyhow::{Context, Result};
use chunkstor_core::journal::types::{JournalHeader, TxBlock, TxState};
use chunkstor_core::volume::types::{read_entry, VolumeLayout, CHUNK_BLOCKS, ENTRIES_PER_BLOCK};
use chunkstor_core::{BlockIo, FileDevice, Guid, Page, PAGE_SIZE};
use clap::Parser;
use colored::Colorize;
use std::collections::HashSet;
use std::process::exit;

// ============ 命令行参数 ============

#[derive(Parser)]
#[command(name = "volck.chunkstor")]
#[command(about = "Check a ChunkStor volume", version = "1.0.0")]
struct Args {
    /// Disk image path
    image: String,

    /// Scan the journal ring as well
    #[arg(short, long)]
    check_journal: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct Checker {
    dev: FileDevice,
    verbose: bool,
    errors: u32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    println!(
        "{}",
        format!("volck.chunkstor: checking {}", args.image).bright_cyan()
    );

    match run(&args) {
        Ok(0) => {
            println!("\n{}", "✅ Volume is clean".bright_green().bold());
            exit(0);
        }
        Ok(errors) => {
            println!(
                "\n{}",
                format!("❌ {} problem(s) found", errors).bright_red().bold()
            );
            exit(1);
        }
        Err(err) => {
            eprintln!("{} {:#}", "volck: cannot check:".bright_red(), err);
            exit(2);
        }
    }
}

fn run(args: &Args) -> Result<u32> {
    // 只读打开, 不抢独占: 在线的卷也能检查
    let dev = FileDevice::open_read_only(&args.image).context("Failed to open image")?;
    let mut checker = Checker {
        dev,
        verbose: args.verbose,
        errors: 0,
    };

    let layout = checker.check_superblock()?;
    checker.check_journal_header(&layout);
    if args.check_journal {
        checker.check_journal_ring(&layout);
    }
    checker.check_chunk_table(&layout);

    Ok(checker.errors)
}

impl Checker {
    fn read_block(&self, block: u64) -> Result<Page> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.dev
            .read_at(&mut buf, block * PAGE_SIZE as u64)
            .with_context(|| format!("Failed to read block {}", block))?;
        let page = Page::new();
        page.write(&buf, 0);
        Ok(page)
    }

    fn fail(&mut self, message: String) {
        println!("  {} {}", "FAIL".bright_red(), message);
        self.errors += 1;
    }

    fn pass(&self, message: String) {
        println!("  {} {}", "PASS".bright_green(), message);
    }

    // ============ 超级块 ============

    fn check_superblock(&mut self) -> Result<VolumeLayout> {
        println!("\n{}", "[1] Superblock".bold());
        let page = self.read_block(0)?;
        let layout = match VolumeLayout::decode_from(&page) {
            Ok(layout) => layout,
            Err(err) => {
                self.fail(format!("superblock rejected: {}", err));
                anyhow::bail!("superblock unreadable, not a ChunkStor volume?");
            }
        };
        self.pass(format!(
            "magic/hash ok, volume {} ({} blocks)",
            layout.volume_id, layout.total_blocks
        ));

        let capacity = self.dev.capacity()?;
        if layout.total_blocks * PAGE_SIZE as u64 > capacity {
            self.fail(format!(
                "geometry exceeds device: {} blocks > {} bytes",
                layout.total_blocks, capacity
            ));
        } else {
            self.pass("geometry fits the device".to_string());
        }

        if self.verbose {
            println!("{:#?}", layout);
        }
        Ok(layout)
    }

    // ============ journal 头 ============

    fn check_journal_header(&mut self, layout: &VolumeLayout) {
        println!("\n{}", "[2] Journal header".bold());
        let page = match self.read_block(layout.journal_start) {
            Ok(page) => page,
            Err(err) => {
                self.fail(format!("unreadable: {:#}", err));
                return;
            }
        };
        match JournalHeader::decode_from(&page) {
            Ok(size) if size == layout.journal_size => {
                self.pass(format!("magic/hash ok, ring of {} blocks", size));
            }
            Ok(size) => {
                self.fail(format!(
                    "ring size {} disagrees with superblock {}",
                    size, layout.journal_size
                ));
            }
            Err(err) => self.fail(format!("header rejected: {}", err)),
        }
    }

    // ============ journal 环普查 ============

    fn check_journal_ring(&mut self, layout: &VolumeLayout) {
        println!("\n{}", "[3] Journal ring".bold());
        let mut complete_groups = 0u64;
        let mut stray_blocks = 0u64;
        let mut group: Option<(Guid, u64)> = None;

        for step in 0..layout.journal_size - 1 {
            let index = layout.journal_start + 1 + step;
            let page = match self.read_block(index) {
                Ok(page) => page,
                Err(err) => {
                    self.fail(format!("block {} unreadable: {:#}", index, err));
                    return;
                }
            };
            let block = match TxBlock::decode_from(&page) {
                Ok(block) => block,
                Err(_) => {
                    // 撕裂尾部, 正常终点
                    if self.verbose {
                        println!("  torn tail at block {}", index);
                    }
                    break;
                }
            };
            match block {
                TxBlock::Begin { tx_id } => group = Some((tx_id, 0)),
                TxBlock::Data { tx_id, .. } => match &mut group {
                    Some((id, count)) if *id == tx_id => *count += 1,
                    _ => {
                        stray_blocks += 1;
                        group = None;
                    }
                },
                TxBlock::Commit { tx_id, state, .. } => match group.take() {
                    Some((id, _)) if id == tx_id => {
                        if state != TxState::Committed {
                            self.fail(format!(
                                "tx {} committed with state {:?}",
                                tx_id, state
                            ));
                        }
                        complete_groups += 1;
                    }
                    _ => stray_blocks += 1,
                },
            }
        }

        self.pass(format!(
            "{} complete transaction group(s), {} stray block(s)",
            complete_groups, stray_blocks
        ));
        if group.is_some() {
            self.pass("one incomplete group at the tail (would be discarded)".to_string());
        }
    }

    // ============ chunk 表 ============

    fn check_chunk_table(&mut self, layout: &VolumeLayout) {
        println!("\n{}", "[4] Chunk table".bold());
        let mut used = 0u64;
        let mut seen: HashSet<Guid> = HashSet::new();

        for block in 0..layout.table_blocks {
            let page = match self.read_block(layout.table_start + block) {
                Ok(page) => page,
                Err(err) => {
                    self.fail(format!("table block {} unreadable: {:#}", block, err));
                    return;
                }
            };
            page.with_data(|buf| {
                for i in 0..ENTRIES_PER_BLOCK {
                    let slot = block * ENTRIES_PER_BLOCK as u64 + i as u64;
                    let Some((id, info)) = read_entry(buf, i) else {
                        continue;
                    };
                    used += 1;
                    if slot >= layout.max_chunks {
                        self.fail(format!("entry {} beyond chunk capacity", slot));
                        continue;
                    }
                    if info.slot != slot {
                        self.fail(format!(
                            "entry {}: slot field {} out of place",
                            slot, info.slot
                        ));
                    }
                    if !seen.insert(id) {
                        self.fail(format!("chunk {} appears twice", id));
                    }
                    if self.verbose {
                        println!(
                            "  chunk {} slot {} size {} blocks {}..{}",
                            id,
                            info.slot,
                            info.data_size,
                            layout.data_start + info.slot * CHUNK_BLOCKS,
                            layout.data_start + (info.slot + 1) * CHUNK_BLOCKS
                        );
                    }
                }
            });
        }

        self.pass(format!(
            "{} chunk(s) allocated of {}",
            used, layout.max_chunks
        ));
    }
}
