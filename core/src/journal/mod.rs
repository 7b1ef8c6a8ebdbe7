// Journal - 事务化写前日志
//
// 设计原理:
// 1. 元数据修改先进 journal: begin / data* / commit 三段块写入环形区
// 2. 后台写线程批量收集待提交事务, 统一落盘, 末尾的头块带 FUA+FLUSH 屏障
// 3. Load 时重放: 完整提交的事务组重新应用到目标位置, 残缺组丢弃
// 4. 正常停机清零本次会话用过的环区, 下次加载看到空日志
//
// 环形区从 start+1 开始 (start 块是头), 分配索引到 start+size 就绕回
// start+1。提交时间戳单调递增, 重放据此截掉绕回后的陈旧残留。

pub mod types;

use crate::bio::BioList;
use crate::device::{BlockIo, DeviceRef};
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::page::{Page, PAGE_SIZE};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use self::types::{JournalHeader, TxBlock};

pub use self::types::TxState;

/// 写线程空转等待上限, 同时限定 Stop 的收尾延迟
const WRITER_WAIT: Duration = Duration::from_millis(10);

/// 清环时每批 bio 数
const WIPE_BATCH: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    New,
    Replaying,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    start: u64,
    size: u64,
    curr_block_index: u64,
    state: JournalState,
    /// 本次会话里分配是否绕回过 (决定停机时清多少)
    wrapped: bool,
}

impl Inner {
    /// 返回当前空闲块索引并前进; start+size 绕回 start+1,
    /// 永远不返回 start 或 start+size
    fn next_index(&mut self) -> u64 {
        let index = self.curr_block_index;
        if self.curr_block_index + 1 >= self.start + self.size {
            self.curr_block_index = self.start + 1;
            self.wrapped = true;
        } else {
            self.curr_block_index += 1;
        }
        index
    }
}

pub struct Journal {
    dev: DeviceRef,
    inner: RwLock<Inner>,
    /// 活跃事务表; 表里只会有 New / Committing 状态的事务
    tx_table: Mutex<HashMap<Guid, Arc<Transaction>>>,
    /// 待提交队列, 写线程按 FIFO 消费
    queue: Mutex<Vec<Arc<Transaction>>>,
    queue_event: Condvar,
    stopping: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    pub fn new(dev: DeviceRef) -> Arc<Journal> {
        Arc::new(Journal {
            dev,
            inner: RwLock::new(Inner {
                start: 0,
                size: 0,
                curr_block_index: 0,
                state: JournalState::New,
                wrapped: false,
            }),
            tx_table: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            queue_event: Condvar::new(),
            stopping: AtomicBool::new(false),
            writer: Mutex::new(None),
        })
    }

    /// 在 start 块写入 journal 头。size 含头块, 必须 ≥ 2。
    pub fn format(&self, start: u64, size: u64) -> Result<()> {
        if size < 2 {
            return Err(Error::InvalidValue);
        }

        let page = Page::alloc();
        JournalHeader::encode_into(&page, size);
        let mut list = BioList::new(self.dev.clone());
        list.add_exec(page, start * PAGE_SIZE as u64, true, true)?;

        let mut inner = self.inner.write().unwrap();
        inner.start = start;
        inner.size = size;
        info!("[Journal] formatted: start={} size={}", start, size);
        Ok(())
    }

    /// 读头块、重放、启动写线程。
    pub fn load(self: &Arc<Self>, start: u64) -> Result<()> {
        if self.inner.read().unwrap().state == JournalState::Running {
            return Err(Error::InvalidState);
        }
        let page = Page::alloc();
        let mut list = BioList::new(self.dev.clone());
        list.add_exec(page.clone(), start * PAGE_SIZE as u64, false, false)?;

        let size = JournalHeader::decode_from(&page)?;
        if size <= 1 {
            return Err(Error::BadSize);
        }

        {
            let mut inner = self.inner.write().unwrap();
            inner.start = start;
            inner.size = size;
            inner.state = JournalState::Replaying;
        }

        self.replay()?;

        {
            let mut inner = self.inner.write().unwrap();
            inner.curr_block_index = start + 1;
            inner.wrapped = false;
            inner.state = JournalState::Running;
        }

        self.stopping.store(false, Ordering::Release);
        let journal = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("journal-writer".into())
            .spawn(move || journal.writer_loop())
            .map_err(Error::from)?;
        *self.writer.lock().unwrap() = Some(handle);

        info!("[Journal] loaded: start={} size={}", start, size);
        Ok(())
    }

    /// 扫描环区, 重放完整提交的事务组。
    ///
    /// 哈希不符的块是撕裂尾部, 终止扫描; 组外的散块丢弃;
    /// 提交时间戳回退说明撞上了绕回前的残留, 同样终止。
    fn replay(&self) -> Result<()> {
        let (start, size) = {
            let inner = self.inner.read().unwrap();
            (inner.start, inner.size)
        };

        let mut replayed = 0usize;
        let mut last_time = 0u64;
        let mut group: Option<(Guid, Vec<(u64, Vec<u8>)>)> = None;
        let page = Page::alloc();

        for step in 0..size - 1 {
            let index = start + 1 + step;
            let mut list = BioList::new(self.dev.clone());
            list.add_exec(page.clone(), index * PAGE_SIZE as u64, false, false)?;

            let block = match TxBlock::decode_from(&page) {
                Ok(block) => block,
                Err(Error::DataCorrupt) | Err(Error::InvalidValue) => break,
                Err(err) => return Err(err),
            };

            match block {
                TxBlock::Begin { tx_id } => {
                    group = Some((tx_id, Vec::new()));
                }
                TxBlock::Data {
                    tx_id,
                    position,
                    data,
                } => match &mut group {
                    Some((id, blocks)) if *id == tx_id => blocks.push((position, data)),
                    _ => {
                        trace!("[Journal] replay: stray data block at {}", index);
                        group = None;
                    }
                },
                TxBlock::Commit { tx_id, state, time } => match group.take() {
                    Some((id, blocks)) if id == tx_id => {
                        if state != TxState::Committed {
                            warn!("[Journal] replay: commit block with state {:?}", state);
                            return Err(Error::DataCorrupt);
                        }
                        if time < last_time {
                            debug!("[Journal] replay: stale group {} past wrap point", tx_id);
                            break;
                        }
                        for (position, data) in &blocks {
                            self.dev.write_at(data, *position)?;
                        }
                        last_time = time;
                        replayed += 1;
                        trace!("[Journal] replay: applied tx {} ({} blocks)", tx_id, blocks.len());
                    }
                    _ => {
                        trace!("[Journal] replay: stray commit block at {}", index);
                    }
                },
            }
        }

        if replayed > 0 {
            self.dev.flush()?;
        }
        info!("[Journal] replay complete: {} transactions applied", replayed);
        Ok(())
    }

    /// 开启新事务
    pub fn begin_tx(self: &Arc<Self>) -> Result<Arc<Transaction>> {
        {
            let inner = self.inner.read().unwrap();
            if inner.state != JournalState::Running {
                return Err(Error::InvalidState);
            }
        }

        let tx = Arc::new(Transaction::new(Arc::downgrade(self)));
        let mut table = self.tx_table.lock().unwrap();
        if table.contains_key(&tx.tx_id) {
            return Err(Error::AlreadyExists);
        }
        table.insert(tx.tx_id, Arc::clone(&tx));
        trace!("[Journal] begin tx {}", tx.tx_id);
        Ok(tx)
    }

    fn unlink_tx(&self, tx: &Transaction) {
        let mut table = self.tx_table.lock().unwrap();
        if let Some(existing) = table.get(&tx.tx_id) {
            if std::ptr::eq(Arc::as_ptr(existing), tx as *const Transaction) {
                table.remove(&tx.tx_id);
            }
        }
    }

    fn start_commit(&self, tx: &Arc<Transaction>) -> Result<()> {
        {
            let table = self.tx_table.lock().unwrap();
            match table.get(&tx.tx_id) {
                Some(existing) if Arc::ptr_eq(existing, tx) => {}
                _ => return Err(Error::NotFound),
            }
        }

        let mut queue = self.queue.lock().unwrap();
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        queue.push(Arc::clone(tx));
        self.queue_event.notify_all();
        trace!("[Journal] tx {} queued for commit", tx.tx_id);
        Ok(())
    }

    /// journal 占据的设备字节区间
    pub fn byte_range(&self) -> (u64, u64) {
        let inner = self.inner.read().unwrap();
        (
            inner.start * PAGE_SIZE as u64,
            (inner.start + inner.size) * PAGE_SIZE as u64,
        )
    }

    pub fn start(&self) -> u64 {
        self.inner.read().unwrap().start
    }

    pub fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    pub fn curr_block_index(&self) -> u64 {
        self.inner.read().unwrap().curr_block_index
    }

    pub fn state(&self) -> JournalState {
        self.inner.read().unwrap().state
    }

    // ============ 写线程 ============

    fn writer_loop(self: Arc<Self>) {
        trace!("[Journal] writer thread start");

        loop {
            let batch: Vec<Arc<Transaction>> = {
                let mut queue = self.queue.lock().unwrap();
                if queue.is_empty() && !self.stopping.load(Ordering::Acquire) {
                    let (guard, _) = self
                        .queue_event
                        .wait_timeout(queue, WRITER_WAIT)
                        .unwrap();
                    queue = guard;
                }
                if self.stopping.load(Ordering::Acquire) {
                    break;
                }
                std::mem::take(&mut *queue)
            };

            if batch.is_empty() {
                continue;
            }

            let mut list = BioList::new(self.dev.clone());
            let mut result = Ok(());
            for tx in &batch {
                if let Err(err) = self.write_tx_blocks(tx, &mut list) {
                    result = Err(err);
                    break;
                }
            }
            if result.is_ok() {
                result = self.flush_header(&mut list);
            }
            if result.is_ok() {
                result = list.exec(true);
            }

            // 整批共享同一个结果: 屏障之前没有任何事务算持久
            for tx in &batch {
                tx.on_commit_complete(result.clone());
            }
        }

        // 停机: 还在排队的事务全部取消
        let leftovers: Vec<Arc<Transaction>> =
            std::mem::take(&mut *self.queue.lock().unwrap());
        for tx in leftovers {
            tx.cancel();
        }

        trace!("[Journal] writer thread stop");
    }

    /// 给一个事务的 begin/data/commit 块分配环内索引并入列。
    /// 失败时就地完成该事务, 所在的整批随之作废。
    fn write_tx_blocks(&self, tx: &Arc<Transaction>, list: &mut BioList) -> Result<()> {
        let result = {
            let mut geo = self.inner.write().unwrap();
            let ti = tx.inner.lock().unwrap();
            if ti.state != TxState::Committing {
                Err(Error::InvalidState)
            } else {
                self.stage_tx_locked(&mut geo, tx, &ti.data_blocks, list)
            }
        };

        if let Err(err) = &result {
            tx.on_commit_complete(Err(err.clone()));
        }
        result
    }

    fn stage_tx_locked(
        &self,
        geo: &mut Inner,
        tx: &Transaction,
        data_blocks: &[TxBlock],
        list: &mut BioList,
    ) -> Result<()> {
        let index = geo.next_index();
        self.add_tx_block(geo, &tx.begin_block, index, list)?;

        for block in data_blocks {
            let index = geo.next_index();
            self.add_tx_block(geo, block, index, list)?;
        }

        let commit = TxBlock::Commit {
            tx_id: tx.tx_id,
            state: TxState::Committed,
            time: now_nanos(),
        };
        let index = geo.next_index();
        self.add_tx_block(geo, &commit, index, list)?;

        trace!("[Journal] staged tx {} ({} data blocks)", tx.tx_id, data_blocks.len());
        Ok(())
    }

    fn add_tx_block(
        &self,
        geo: &Inner,
        block: &TxBlock,
        index: u64,
        list: &mut BioList,
    ) -> Result<()> {
        if index <= geo.start || index >= geo.start + geo.size {
            return Err(Error::InvalidValue);
        }
        let page = Page::alloc();
        block.encode_into(&page)?;
        list.add_io(page, index * PAGE_SIZE as u64, true)
    }

    /// 批末尾追加带屏障的头块重写: 这是唯一的持久化屏障
    fn flush_header(&self, list: &mut BioList) -> Result<()> {
        let (start, size) = {
            let inner = self.inner.read().unwrap();
            (inner.start, inner.size)
        };
        let page = Page::alloc();
        JournalHeader::encode_into(&page, size);
        list.add_io(page, start * PAGE_SIZE as u64, true)?;
        list.add_flush()
    }

    // ============ 停机 ============

    /// 停写线程, 取消未完成的事务, 清零本次会话用过的环区。
    pub fn stop(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.state == JournalState::Stopped || inner.state == JournalState::New {
                return;
            }
            inner.state = JournalState::Stopping;
        }
        info!("[Journal] stopping");

        self.stopping.store(true, Ordering::Release);
        self.queue_event.notify_all();

        let handle = self.writer.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("[Journal] writer thread panicked");
            }
        }

        // 写线程结束后入队的事务
        let leftovers: Vec<Arc<Transaction>> =
            std::mem::take(&mut *self.queue.lock().unwrap());
        for tx in leftovers {
            tx.cancel();
        }

        // 被丢弃的未提交事务
        let abandoned: Vec<Arc<Transaction>> = {
            let mut table = self.tx_table.lock().unwrap();
            table.drain().map(|(_, tx)| tx).collect()
        };
        for tx in abandoned {
            tx.cancel();
        }

        if let Err(err) = self.wipe_ring() {
            warn!("[Journal] ring wipe failed: {}", err);
        }

        self.inner.write().unwrap().state = JournalState::Stopped;
        info!("[Journal] stopped");
    }

    /// 清零 [start+1, curr) (绕回过则整个环), 再写一次带屏障的头块。
    /// 之后的 Load 看到的是空日志, 重放不会动设备。
    fn wipe_ring(&self) -> Result<()> {
        let (start, size, curr, wrapped) = {
            let inner = self.inner.read().unwrap();
            (
                inner.start,
                inner.size,
                inner.curr_block_index,
                inner.wrapped,
            )
        };
        if size < 2 || curr <= start {
            return Ok(());
        }

        let end = if wrapped { start + size } else { curr };
        let zero = Page::alloc();
        let mut index = start + 1;
        while index < end {
            let mut list = BioList::new(self.dev.clone());
            let batch_end = (index + WIPE_BATCH).min(end);
            while index < batch_end {
                list.add_io(zero.clone(), index * PAGE_SIZE as u64, true)?;
                index += 1;
            }
            list.exec(true)?;
        }

        let page = Page::alloc();
        JournalHeader::encode_into(&page, size);
        let mut list = BioList::new(self.dev.clone());
        list.add_exec(page, start * PAGE_SIZE as u64, true, true)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============ 事务 ============

struct TxInner {
    state: TxState,
    data_blocks: Vec<TxBlock>,
    commit_result: Option<Result<()>>,
}

/// 调用方与写线程共享一个事务: 调用方 Commit/Cancel,
/// 写线程落盘后 on_commit_complete。对 journal 只留弱引用,
/// 生命周期由 Stop 先排干事务表保证。
pub struct Transaction {
    journal: Weak<Journal>,
    tx_id: Guid,
    /// 预构建的 begin 块
    begin_block: TxBlock,
    inner: Mutex<TxInner>,
    commit_event: Condvar,
}

impl Transaction {
    fn new(journal: Weak<Journal>) -> Transaction {
        let tx_id = Guid::generate();
        Transaction {
            journal,
            tx_id,
            begin_block: TxBlock::Begin { tx_id },
            inner: Mutex::new(TxInner {
                state: TxState::New,
                data_blocks: Vec::new(),
                commit_result: None,
            }),
            commit_event: Condvar::new(),
        }
    }

    pub fn tx_id(&self) -> Guid {
        self.tx_id
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().unwrap().state
    }

    /// 把一页数据登记到 position (设备字节偏移)。
    ///
    /// position 0 所在的第一块保留给超级块, journal 自身区间也不可写,
    /// 两者都报 Overlap。页面按数据块容量切分暂存, Commit 前不落盘。
    pub fn write(&self, page: &Page, position: u64) -> Result<()> {
        let journal = self.journal.upgrade().ok_or(Error::InvalidState)?;
        let page_size = page.size() as u64;
        let end = position.checked_add(page_size).ok_or(Error::InvalidValue)?;
        let (journal_begin, journal_end) = journal.byte_range();

        let mut inner = self.inner.lock().unwrap();
        if inner.state != TxState::New {
            return Err(Error::InvalidState);
        }
        if position < page_size {
            return Err(Error::Overlap);
        }
        if position < journal_end && journal_begin < end {
            return Err(Error::Overlap);
        }

        let mut staged = Vec::new();
        let mut offset = 0usize;
        let mut target = position;
        while offset < page.size() {
            let len = types::TX_DATA_CAPACITY.min(page.size() - offset);
            let mut data = vec![0u8; len];
            page.read(&mut data, offset);
            staged.push(TxBlock::Data {
                tx_id: self.tx_id,
                position: target,
                data,
            });
            offset += len;
            target += len as u64;
        }
        inner.data_blocks.extend(staged);

        trace!("[Tx] {} write at {}", self.tx_id, position);
        Ok(())
    }

    /// 入队并阻塞到写线程完成。返回写线程存下的结果。
    pub fn commit(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != TxState::New {
                return Err(Error::InvalidState);
            }
            inner.state = TxState::Committing;
        }

        let enqueue = match self.journal.upgrade() {
            Some(journal) => journal.start_commit(self),
            None => Err(Error::Cancelled),
        };
        if let Err(err) = enqueue {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.state = TxState::Canceled;
                inner.commit_result = Some(Err(err.clone()));
            }
            if let Some(journal) = self.journal.upgrade() {
                journal.unlink_tx(self);
            }
            return Err(err);
        }

        let mut inner = self.inner.lock().unwrap();
        while inner.commit_result.is_none() {
            inner = self.commit_event.wait(inner).unwrap();
        }
        inner.commit_result.clone().unwrap_or(Err(Error::NotExecuted))
    }

    /// 放弃事务。已经完成的事务不受影响。
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.commit_result.is_some()
                || matches!(inner.state, TxState::Committed | TxState::Canceled)
            {
                return;
            }
            inner.state = TxState::Canceled;
            inner.commit_result = Some(Err(Error::Cancelled));
        }
        self.commit_event.notify_all();
        if let Some(journal) = self.journal.upgrade() {
            journal.unlink_tx(self);
        }
        trace!("[Tx] {} cancelled", self.tx_id);
    }

    /// 写线程回调: 发布结果、迁移状态、唤醒提交者。
    fn on_commit_complete(&self, result: Result<()>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.commit_result.is_some() {
                return;
            }
            inner.state = match result {
                Ok(()) => TxState::Committed,
                Err(_) => TxState::Canceled,
            };
            inner.commit_result = Some(result);
        }
        self.commit_event.notify_all();
        if let Some(journal) = self.journal.upgrade() {
            journal.unlink_tx(self);
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
