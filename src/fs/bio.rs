//! 缓存层
//!
//! 缓冲区缓存保存磁盘块内容的内存副本，既减少磁盘读取，
//! 也为多个线程共同使用的磁盘块提供同步点。
//!
//! 接口：
//! * 调用 [`Bcache::bread`] 获得某个磁盘块的缓冲区；
//! * 修改缓冲区数据后调用 [`Buf::bwrite`] 写回磁盘；
//! * 用完后调用 [`Buf::brelse`]（或直接丢弃 [`Buf`]）；
//! * 同一时间只有一个线程可以使用一个缓冲区，不要长时间持有。
//!
//! 缓冲块按 `blockno % NBUCKET` 分布在若干哈希桶中，每个桶有自己的自旋锁，
//! 不相关的块之间几乎不会竞争。桶内没有空闲块时才会拿全局迁移锁，
//! 从其他桶"借"一个最久未使用的空闲块过来。

use array_macro::array;
use log::{debug, error, trace};

use core::hint;
use core::iter;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::consts::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use crate::trap::{Clock, Ticks};

/// 链表结束标记。
const NIL: usize = usize::MAX;

/// 缓冲区缓存（Buffer Cache），块设备与上层之间的缓冲层。
///
/// `Bcache` 持有固定数量（`NBUF`）的缓冲块，生命周期内既不增加也不释放，
/// 只会改变每个缓冲块当前代表的 `(dev, blockno)`。
/// 通常在启动时构造一次，然后以共享引用（或 `Arc`）交给所有使用者。
///
/// # 锁的分工
/// - `buckets[i]`：保护第 `i` 个桶的链表，以及链上各缓冲块的
///   `dev`/`blockno`/`refcnt`/`time`/`next`；
/// - `relocate`：全局迁移锁，只在把缓冲块从一个桶移到另一个桶时使用；
/// - `bufs[i].data`：睡眠锁，保护缓冲块的数据，持有者独占数据。
///
/// 加锁顺序固定为：目标桶 → 全局迁移锁 → 候选块所在桶（只 try_lock），
/// 其余路径任何时候最多持有一个桶锁。
pub struct Bcache<D, C = Ticks> {
    disk: D,
    clock: C,
    relocate: SpinLock<()>,
    buckets: [SpinLock<Bucket>; NBUCKET],
    ctrl: [BufCtrl; NBUF],
    bufs: [BufInner; NBUF],
}

impl<D: BlockDevice, C: Clock> Bcache<D, C> {
    /// 构造缓冲区缓存。
    ///
    /// # 功能说明
    /// 把第 `i` 个缓冲块轮流放入第 `i % NBUCKET` 个桶（头插），
    /// 并把它的块号设为桶号，使"所在桶 = `blockno % NBUCKET`"从一开始就成立。
    /// 所有缓冲块初始时 `refcnt == 0`、`valid == false`。
    ///
    /// # 参数
    /// - `disk`: 块设备驱动；
    /// - `clock`: 节拍源，用于记录缓冲块最近一次被释放的时间。
    pub fn new(disk: D, clock: C) -> Self {
        let cache = Self {
            disk,
            clock,
            relocate: SpinLock::new((), "bcache"),
            buckets: array![_ => SpinLock::new(Bucket::new(), "bucket"); NBUCKET],
            ctrl: array![_ => BufCtrl::new(); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
        };

        for index in 0..NBUF {
            let no = index % NBUCKET;
            let mut bucket = cache.buckets[no].lock();
            let b = &cache.ctrl[index];
            b.blockno.store(no as u32, Ordering::Relaxed);
            b.next.store(bucket.head, Ordering::Relaxed);
            bucket.head = index;
        }

        #[cfg(feature = "verbose_init_info")]
        debug!("bcache: {} buffers in {} buckets, {} bytes each", NBUF, NBUCKET, BSIZE);
        #[cfg(not(feature = "verbose_init_info"))]
        debug!("bcache: setup done");

        cache
    }

    /// 块设备驱动。
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 节拍源。
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// 返回一个已加锁、内容有效的缓冲块。
    ///
    /// # 功能说明
    /// 先通过 `bget` 取得缓冲块，若其内容无效则同步地从磁盘读入。
    /// 因此每次调用最多触发一次磁盘读，块已经有效时不读盘。
    ///
    /// # 注意
    /// 若该块正被其他线程持有，本函数会睡眠直到对方释放。
    /// 同时持有（或 pin 住）的块超过 `NBUF` 个时 panic。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D, C> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Acquire) {
            self.disk.read(dev, blockno, b.data_mut());
            self.bufs[b.index].valid.store(true, Ordering::Release);
        }
        b
    }

    /// 在缓存中查找设备 `dev` 上的块 `blockno`，找不到就分配一个缓冲块。
    /// 两种情况下返回的缓冲块都已加锁。
    ///
    /// # 流程
    /// 1. 锁住目标桶，查找命中；命中则增加引用计数，释放桶锁后加睡眠锁返回；
    /// 2. 查找的同时记下本桶中 `time` 最小的空闲块（相同时取先遇到的），
    ///    有则就地改写身份返回；
    /// 3. 本桶没有空闲块时拿全局迁移锁，在整个池中找 `time` 最小的空闲块，
    ///    锁住它所在的桶并复查，确认空闲后把它移到目标桶；
    ///    复查失败则清空候选重新扫描；
    /// 4. 整个池都没有空闲块时 panic。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D, C> {
        let no = blockno as usize % NBUCKET;
        let mut bucket = self.buckets[no].lock();

        // 是否已经缓存？
        let mut lru: Option<(usize, usize)> = None;
        let mut hit = None;
        for index in self.chain(bucket.head) {
            let b = &self.ctrl[index];
            if b.matches(dev, blockno) {
                hit = Some(index);
                break;
            }
            if let Some(time) = b.idle_since() {
                if lru.map_or(true, |(_, best)| time < best) {
                    lru = Some((index, time));
                }
            }
        }

        if let Some(index) = hit {
            let b = &self.ctrl[index];
            b.refcnt.store(b.refcnt() + 1, Ordering::Release);
            drop(bucket);
            trace!("bget: hit dev {} block {} in buf {}", dev, blockno, index);
            return self.locked(index, dev, blockno);
        }

        // 未缓存，先回收本桶内最久未用的空闲块
        if let Some((index, _)) = lru {
            self.claim(index, dev, blockno);
            drop(bucket);
            trace!("bget: recycle buf {} for dev {} block {}", index, dev, blockno);
            return self.locked(index, dev, blockno);
        }

        // 本桶已无空闲块，从整个池中借一个
        let index = self.relocate_lru(&mut bucket, dev, blockno, || self.global_lru());
        drop(bucket);
        trace!("bget: move buf {} to bucket {}", index, no);

        self.locked(index, dev, blockno)
    }

    /// 持有全局迁移锁，把某个空闲缓冲块从它所在的桶移到目标桶 `bucket`。
    ///
    /// # 功能说明
    /// 每一轮调用 `scan` 取得候选块，然后 `try_lock` 候选块所在的桶并复查引用计数：
    /// - 桶锁正被占用：视为暂时竞争，清空候选重新扫描；
    /// - 复查时已被别人取走：释放桶锁，重新扫描；
    /// - 复查通过：在仍然持有全部锁时改写身份、摘链并头插到目标桶。
    ///
    /// # 参数
    /// - `bucket`: 已加锁的目标桶（`blockno % NBUCKET`）；
    /// - `scan`: 候选来源，正常路径下是 [`global_lru`](Self::global_lru)。
    ///
    /// # 返回值
    /// 被迁移的缓冲块下标，返回时其引用计数为 1。
    ///
    /// # Panics
    /// `scan` 找不到任何空闲块时 panic（`"bget: no buffers"`）。
    fn relocate_lru(
        &self,
        bucket: &mut Bucket,
        dev: u32,
        blockno: u32,
        mut scan: impl FnMut() -> Option<usize>,
    ) -> usize {
        let relocate = self.relocate.lock();
        let index = loop {
            let Some(index) = scan() else {
                error!("bget: all {} buffers are in use", NBUF);
                panic!("bget: no buffers");
            };

            // 持有全局迁移锁时候选块不会换桶，这里读到的桶号是稳定的
            let old = self.ctrl[index].blockno() as usize % NBUCKET;
            let Some(mut old_bucket) = self.buckets[old].try_lock() else {
                trace!("bget: bucket {} busy, rescan", old);
                hint::spin_loop();
                continue;
            };
            if self.ctrl[index].refcnt() != 0 {
                drop(old_bucket);
                trace!("bget: buf {} taken before relocation, rescan", index);
                continue;
            }

            self.claim(index, dev, blockno);
            self.unlink(&mut old_bucket, index);
            self.ctrl[index].next.store(bucket.head, Ordering::Relaxed);
            bucket.head = index;
            drop(old_bucket);
            break index;
        };
        drop(relocate);
        index
    }

    /// 释放缓冲块的引用，引用计数归零时记录释放时间。
    ///
    /// 调用前必须已经释放睡眠锁。
    fn brelse(&self, index: usize) {
        let b = &self.ctrl[index];
        // 引用计数非零时块号不会被改写
        let _bucket = self.buckets[b.blockno() as usize % NBUCKET].lock();
        let refcnt = b.refcnt() - 1;
        b.refcnt.store(refcnt, Ordering::Release);
        if refcnt == 0 {
            // 没有人在等它了
            b.time.store(self.clock.ticks(), Ordering::Release);
        }
    }

    fn bpin(&self, index: usize) {
        let b = &self.ctrl[index];
        let _bucket = self.buckets[b.blockno() as usize % NBUCKET].lock();
        b.refcnt.store(b.refcnt() + 1, Ordering::Release);
    }

    fn bunpin(&self, index: usize) {
        let b = &self.ctrl[index];
        let _bucket = self.buckets[b.blockno() as usize % NBUCKET].lock();
        let rc = b.refcnt();
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        b.refcnt.store(rc - 1, Ordering::Release);
    }

    /// 加睡眠锁并构造句柄。调用者已为该缓冲块增加过引用计数，且不持有任何桶锁。
    fn locked(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D, C> {
        Buf {
            index,
            dev,
            blockno,
            cache: self,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 把空闲缓冲块改写为 `(dev, blockno)`，需持有它当前所在桶的锁。
    fn claim(&self, index: usize, dev: u32, blockno: u32) {
        let b = &self.ctrl[index];
        b.dev.store(dev, Ordering::Relaxed);
        b.blockno.store(blockno, Ordering::Relaxed);
        self.bufs[index].valid.store(false, Ordering::Relaxed);
        b.refcnt.store(1, Ordering::Release);
    }

    /// 在整个池中找 `time` 最小的空闲块。
    ///
    /// 不持有桶锁读取，结果只是提示，使用前必须在桶锁下复查。
    fn global_lru(&self) -> Option<usize> {
        let mut lru: Option<(usize, usize)> = None;
        for (index, b) in self.ctrl.iter().enumerate() {
            if let Some(time) = b.idle_since() {
                if lru.map_or(true, |(_, best)| time < best) {
                    lru = Some((index, time));
                }
            }
        }
        lru.map(|(index, _)| index)
    }

    /// 从桶链表中摘除 `index`。
    fn unlink(&self, bucket: &mut Bucket, index: usize) {
        let next = self.ctrl[index].next.load(Ordering::Relaxed);
        if bucket.head == index {
            bucket.head = next;
            return;
        }
        let prev = self
            .chain(bucket.head)
            .find(|&i| self.ctrl[i].next.load(Ordering::Relaxed) == index)
            .unwrap_or_else(|| panic!("bget: buf {} not in its bucket", index));
        self.ctrl[prev].next.store(next, Ordering::Relaxed);
    }

    /// 从 `head` 开始遍历一条桶链表，需持有该桶的锁。
    fn chain(&self, head: usize) -> impl Iterator<Item = usize> + '_ {
        iter::successors((head != NIL).then_some(head), move |&index| {
            let next = self.ctrl[index].next.load(Ordering::Relaxed);
            (next != NIL).then_some(next)
        })
    }
}

/// 已加锁的缓冲块句柄，由 [`Bcache::bread`] 返回。
///
/// 持有句柄即持有该缓冲块的睡眠锁，可以独占读写其数据。
/// 句柄被丢弃（或调用 [`Buf::brelse`]）时释放睡眠锁和引用。
/// 句柄不能跨线程转移。
pub struct Buf<'a, D: BlockDevice, C: Clock> {
    /// 缓冲块在池中的下标
    index: usize,
    dev: u32,
    blockno: u32,
    cache: &'a Bcache<D, C>,
    /// 总是 `Some`，只在析构时取出
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockDevice, C: Clock> Buf<'a, D, C> {
    /// 缓冲块在池中的下标，同一个缓冲块被回收复用时下标不变。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 缓冲块所属的设备号。
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// 读取缓冲块对应的磁盘块号
    ///
    /// # 返回值
    /// 构造句柄时确定的块号，持有句柄期间不会改变。
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 数据是否反映了磁盘上的内容，`bread` 返回的句柄总是有效。
    pub fn valid(&self) -> bool {
        self.cache.bufs[self.index].valid.load(Ordering::Acquire)
    }

    /// 获取缓冲块数据的只读引用
    ///
    /// # 功能说明
    /// 句柄持有睡眠锁，数据在句柄存活期间只属于当前线程。
    pub fn data(&self) -> &BufData {
        self.data.as_ref().unwrap()
    }

    /// 获取缓冲块数据的可变引用
    ///
    /// # 功能说明
    /// 修改只发生在内存中，需要调用 [`bwrite`](Self::bwrite) 才会写回磁盘。
    ///
    /// # 返回值
    /// 可直接按字节修改的 [`BufData`]。
    pub fn data_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap()
    }

    /// 把缓冲块内容写回磁盘，必须持有睡眠锁。
    pub fn bwrite(&mut self) {
        if !self.cache.bufs[self.index].data.holding() {
            panic!("bwrite");
        }
        let (dev, blockno) = (self.dev, self.blockno);
        self.cache.disk.write(dev, blockno, self.data());
    }

    /// 释放缓冲块，之后不能再使用它。
    pub fn brelse(self) {
        drop(self);
    }

    /// 增加引用计数，使缓冲块在之后的释放后仍然驻留、不会被回收。
    ///
    /// # 功能说明
    /// 只能通过已加锁的句柄调用，不提供按下标 pin 任意缓冲块的接口。
    /// 不涉及睡眠锁，也不改变释放时间。通常由日志层在事务提交前调用，
    /// 之后每次 `pin` 都要由一次 [`unpin`](Self::unpin) 抵消。
    pub fn pin(&self) {
        self.cache.bpin(self.index);
    }

    /// 撤销一次 [`pin`](Self::pin)。
    ///
    /// 同样要求持有该缓冲块的句柄。
    ///
    /// # Panics
    /// 引用计数不大于当前句柄自身持有的那一份（`refcnt <= 1`）时 panic，
    /// 这只能发现"没有 pin 过就 unpin"；其余的配对由调用者保证。
    pub fn unpin(&self) {
        self.cache.bunpin(self.index);
    }
}

impl<'a, D: BlockDevice, C: Clock> Drop for Buf<'a, D, C> {
    fn drop(&mut self) {
        if let Some(guard) = self.data.take() {
            if !self.cache.bufs[self.index].data.holding() {
                panic!("brelse");
            }
            drop(guard);
            self.cache.brelse(self.index);
        }
    }
}

/// 哈希桶：一条缓冲块单链表的表头。
struct Bucket {
    head: usize,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: NIL }
    }
}

/// 缓冲块的元数据。
///
/// 只在持有缓冲块当前所在桶的锁时修改；
/// 全局扫描会在不持有桶锁的情况下读取 `refcnt` 与 `time`，因此使用原子类型。
struct BufCtrl {
    dev: AtomicU32,
    blockno: AtomicU32,
    /// 持有者与 pin 的数量
    refcnt: AtomicUsize,
    /// 最近一次引用计数归零时的节拍，只在 `refcnt == 0` 时有意义
    time: AtomicUsize,
    /// 同一桶中的下一个缓冲块
    next: AtomicUsize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(0),
            refcnt: AtomicUsize::new(0),
            time: AtomicUsize::new(0),
            next: AtomicUsize::new(NIL),
        }
    }

    fn blockno(&self) -> u32 {
        self.blockno.load(Ordering::Relaxed)
    }

    fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    fn matches(&self, dev: u32, blockno: u32) -> bool {
        self.dev.load(Ordering::Relaxed) == dev && self.blockno() == blockno
    }

    /// 空闲时返回释放时间。
    fn idle_since(&self) -> Option<usize> {
        if self.refcnt() == 0 {
            Some(self.time.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

struct BufInner {
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// 一个磁盘块大小的数据。
#[derive(Clone)]
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }

    pub fn copy_from(&mut self, other: &BufData) {
        self.0.copy_from_slice(&other.0);
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
