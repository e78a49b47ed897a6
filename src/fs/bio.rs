//! 缓存层
//!
//! 缓冲区缓存按块号散列到 `NBUCKET` 个哈希桶中，每个桶有自己的自旋锁，
//! 不同块的查找因此不会争用同一把锁。缓冲块本身是固定数组中的槽位，
//! 桶内链表只保存槽位下标，槽位在桶之间迁移只需修改几个下标。
//!
//! 锁的层次：
//! * `evict` 串行化所有的回收扫描，扫描期间最多同时持有一个桶锁；
//! * 桶锁保护桶内链表以及桶中每个槽位的元数据（设备号、块号、引用计数、时间戳）；
//! * `claimed` 只保护“已声明槽位数”计数器，总是在持有桶锁时短暂获取；
//! * 每个槽位的数据由睡眠锁保护，获取睡眠锁之前必须释放所有自旋锁。

use array_macro::array;

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::process::CpuManager;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 空链接
const NIL: usize = usize::MAX;

/// 块设备的同步读写接口，由磁盘驱动实现。
///
/// `rw` 在数据传输完成之后才返回。`writing` 为 `true` 时把 `data` 写入磁盘，
/// 否则把磁盘内容读入 `data`。
pub trait BlockDevice {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        (**self).rw(dev, blockno, data, writing)
    }
}

#[inline]
fn hash(blockno: u32) -> usize {
    blockno as usize % NBUCKET
}

/// 分桶的缓冲区缓存（Buffer Cache）。
///
/// `Bcache` 提供一个固定大小的缓冲块池，用于缓存磁盘块数据。
/// 每个 `(dev, blockno)` 在任意时刻至多绑定一个缓冲块。
/// 池中槽位按需声明：尚有从未使用过的槽位时直接取用，
/// 全部声明完毕后按桶内 LRU（最近最少使用）策略回收引用计数为零的槽位。
///
/// `new` 是 `const fn`，内核可以直接把缓存放进 `static` 中。
pub struct Bcache<D> {
    /// 块设备驱动
    disk: D,

    /// 已声明（绑定过块）的槽位数量。
    claimed: SpinLock<usize>,

    /// 回收协调锁，同一时刻只允许一个进程扫描各桶寻找可回收槽位。
    evict: SpinLock<()>,

    /// 哈希桶，每个桶是一条由槽位下标串起的单向链表。
    buckets: [SpinLock<Bucket>; NBUCKET],

    /// 槽位元数据，按下标与 `bufs` 一一对应。
    ///
    /// 每个槽位的元数据只在持有其所在桶的锁时读写；
    /// 使用原子类型只是为了让数组可以被共享，内存序由桶锁保证。
    ctrl: [BufCtrl; NBUF],

    /// 槽位数据。
    bufs: [BufInner; NBUF],
}

impl<D> Bcache<D> {
    pub const fn new(disk: D) -> Self {
        Self {
            disk,
            claimed: SpinLock::new(0, "bcache"),
            evict: SpinLock::new((), "bcache_hash"),
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache_bucket"); NBUCKET],
            ctrl: array![_ => BufCtrl::new(); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 访问底层块设备。
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 已声明的槽位数量。
    pub fn claimed(&self) -> usize {
        *self.claimed.lock()
    }

    /// 查询 `(dev, blockno)` 当前的引用计数，未被缓存时返回 `None`。
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let bucket = self.buckets[hash(blockno)].lock();
        let refcnt = self.find(&bucket, dev, blockno)
            .map(|index| self.ctrl[index].refcnt.load(Ordering::Relaxed));
        drop(bucket);
        refcnt
    }

    /// 统计所有桶中绑定到 `(dev, blockno)` 的槽位数量。
    ///
    /// 逐个桶加锁统计，只有在没有并发获取时结果才是一个一致的快照。
    pub fn bindings(&self, dev: u32, blockno: u32) -> usize {
        let mut count = 0;
        for bucket in self.buckets.iter() {
            let bucket = bucket.lock();
            let mut cur = bucket.head;
            while cur != NIL {
                let b = &self.ctrl[cur];
                if b.matches(dev, blockno) {
                    count += 1;
                }
                cur = b.next.load(Ordering::Relaxed);
            }
        }
        count
    }

    /// 在已加锁的桶中查找 `(dev, blockno)` 对应的槽位。
    fn find(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut cur = bucket.head;
        while cur != NIL {
            let b = &self.ctrl[cur];
            if b.matches(dev, blockno) {
                return Some(cur);
            }
            cur = b.next.load(Ordering::Relaxed);
        }
        None
    }

    /// 将槽位插入到已加锁桶 `bi` 的链表头部。
    fn push_front(&self, bucket: &mut Bucket, bi: usize, index: usize) {
        let b = &self.ctrl[index];
        b.next.store(bucket.head, Ordering::Relaxed);
        b.bucket.store(bi, Ordering::Relaxed);
        bucket.head = index;
    }

    /// 将槽位从已加锁的桶中摘除，`prev` 为其前驱（位于链表头部时为 `NIL`）。
    fn unlink(&self, bucket: &mut Bucket, prev: usize, index: usize) {
        let next = self.ctrl[index].next.load(Ordering::Relaxed);
        if prev == NIL {
            bucket.head = next;
        } else {
            self.ctrl[prev].next.store(next, Ordering::Relaxed);
        }
        self.ctrl[index].next.store(NIL, Ordering::Relaxed);
        self.ctrl[index].bucket.store(NIL, Ordering::Relaxed);
    }

    /// 获取指定设备与块号对应的缓冲块，返回时已持有其数据睡眠锁。
    ///
    /// # 流程解释
    /// 1. 锁住目标桶并查找，命中则增加引用计数，释放桶锁后再获取睡眠锁；
    /// 2. 未命中且池中尚有未声明的槽位时，在持有桶锁的情况下声明一个新槽位，
    ///    绑定并插入目标桶，这条路径从不回收；
    /// 3. 池已全部声明时转入 [`Bcache::recycle`]。
    ///
    /// 新声明或回收的槽位 `valid` 为 `false`，由 `bread` 负责从磁盘读入。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let bi = hash(blockno);
        let mut bucket = self.buckets[bi].lock();

        if let Some(index) = self.find(&bucket, dev, blockno) {
            self.ctrl[index].refcnt.fetch_add(1, Ordering::Relaxed);
            drop(bucket);
            return self.locked(index, dev, blockno);
        }

        // 未缓存：先尝试从未使用过的槽位
        let mut claimed = self.claimed.lock();
        if *claimed < NBUF {
            let index = *claimed;
            *claimed += 1;
            drop(claimed);
            self.ctrl[index].bind(dev, blockno);
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            self.push_front(&mut bucket, bi, index);
            drop(bucket);
            return self.locked(index, dev, blockno);
        }
        drop(claimed);
        drop(bucket);

        self.recycle(dev, blockno)
    }

    /// 按桶内 LRU 策略回收一个引用计数为零的槽位并绑定到 `(dev, blockno)`。
    ///
    /// # 流程解释
    /// - 获取 `evict` 锁，从目标桶开始循环扫描所有桶，每次只锁一个桶；
    /// - 扫描目标桶时重新查找 `(dev, blockno)`：释放桶锁到获取 `evict` 锁之间，
    ///   其他进程可能已经把该块放进了缓存，此时直接使用那个槽位；
    /// - 在当前桶中记录时间戳最小的空闲槽位，找到后重新绑定；
    ///   若它不在目标桶中，则从原桶摘除，释放原桶锁后再插入目标桶。
    ///   摘除与插入都在持有 `evict` 锁时完成，其他未命中者必须等待，
    ///   因此不会出现两个槽位绑定同一个块；
    /// - 所有桶都没有空闲槽位时 panic。
    ///
    /// # 可能的错误
    /// 所有缓冲块都被引用时触发 panic（`"bget: no buffers"`），
    /// 这说明调用者同时持有的缓冲块超过了池的容量。
    fn recycle(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let target = hash(blockno);
        let evict = self.evict.lock();

        let mut bi = target;
        for _ in 0..NBUCKET {
            let mut bucket = self.buckets[bi].lock();

            // (下标, 前驱, 时间戳)
            let mut victim: Option<(usize, usize, u64)> = None;
            let mut prev = NIL;
            let mut cur = bucket.head;
            while cur != NIL {
                let b = &self.ctrl[cur];
                if bi == target && b.matches(dev, blockno) {
                    b.refcnt.fetch_add(1, Ordering::Relaxed);
                    drop(bucket);
                    drop(evict);
                    return self.locked(cur, dev, blockno);
                }
                if b.refcnt.load(Ordering::Relaxed) == 0 {
                    let stamp = b.timestamp.load(Ordering::Relaxed);
                    if victim.map_or(true, |(_, _, min)| stamp < min) {
                        victim = Some((cur, prev, stamp));
                    }
                }
                prev = cur;
                cur = b.next.load(Ordering::Relaxed);
            }

            if let Some((index, prev, _)) = victim {
                self.ctrl[index].bind(dev, blockno);
                self.bufs[index].valid.store(false, Ordering::Relaxed);
                if bi != target {
                    self.unlink(&mut bucket, prev, index);
                    drop(bucket);
                    let mut dst = self.buckets[target].lock();
                    self.push_front(&mut dst, target, index);
                    drop(dst);
                    #[cfg(feature = "kernel_warning")]
                    println!("bget: moved buf {} from bucket {} to bucket {}", index, bi, target);
                } else {
                    drop(bucket);
                }
                drop(evict);
                return self.locked(index, dev, blockno);
            }

            drop(bucket);
            bi = (bi + 1) % NBUCKET;
        }

        panic!("bget: no buffers");
    }

    /// 获取槽位的数据睡眠锁。调用时不得持有任何自旋锁。
    fn locked(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 缓冲块被释放时调用：减少引用计数，归零时记录当前时钟滴答作为时间戳。
    ///
    /// 引用计数大于零的槽位不会被移动，因此它一定位于 `hash(blockno)` 桶中。
    fn brelse(&self, index: usize, blockno: u32) {
        let bucket = self.buckets[hash(blockno)].lock();
        let b = &self.ctrl[index];
        let rc = b.refcnt.load(Ordering::Relaxed);
        if rc == 0 {
            panic!("brelse: refcnt");
        }
        b.refcnt.store(rc - 1, Ordering::Relaxed);
        if rc == 1 {
            b.timestamp.store(CpuManager::ticks(), Ordering::Relaxed);
        }
        drop(bucket);
    }
}

impl<D: BlockDevice> Bcache<D> {
    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 获取 `(dev, blockno)` 对应的缓冲块并持有其数据锁。
    /// 若缓冲块未被标记为有效（即尚未从磁盘加载），则先从磁盘读取。
    /// 当缓冲块正被其他进程持有时，当前进程会休眠等待。
    ///
    /// # 返回值
    /// 返回已加锁的 `Buf`，离开作用域时自动释放（相当于 `brelse`）。
    ///
    /// # 可能的错误
    /// 若所有缓冲块都处于使用中，将触发 panic。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.rw(dev, blockno, b.data_mut(), false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }
}

/// 已加锁的缓冲块，代表某个 `(dev, blockno)` 的磁盘块缓存。
///
/// 持有对其数据的独占访问权限（由 `SleepLockGuard` 保护），
/// 生命周期结束时自动释放数据锁并减少引用计数。
pub struct Buf<'a, D> {
    cache: &'a Bcache<D>,

    /// 缓冲块在缓存数组中的下标。
    index: usize,

    dev: u32,
    blockno: u32,

    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// `Drop` 中先取出并释放数据锁，再减少引用计数。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D> Buf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲块在缓存数组中的下标。
    pub fn index(&self) -> usize {
        self.index
    }

    fn data_ref(&self) -> &BufData {
        match self.data.as_ref() {
            Some(guard) => &**guard,
            None => panic!("buf: not locked"),
        }
    }

    fn data_mut(&mut self) -> &mut BufData {
        match self.data.as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("buf: not locked"),
        }
    }

    /// 将当前缓冲块的引用计数加一，表示“钉住”该块，防止其被回收。
    ///
    /// 与数据锁无关：释放 `Buf` 之后该块仍会留在缓存中，
    /// 直到对应的 `unpin` 被调用。常用于延迟写回。
    pub fn pin(&self) {
        let bucket = self.cache.buckets[hash(self.blockno)].lock();
        self.cache.ctrl[self.index].refcnt.fetch_add(1, Ordering::Relaxed);
        drop(bucket);
    }

    /// 将当前缓冲块的引用计数减一，撤销一次 `pin`。
    ///
    /// 当前 `Buf` 自身占有一个引用，因此计数不能因此降到零，否则 panic。
    pub fn unpin(&self) {
        let bucket = self.cache.buckets[hash(self.blockno)].lock();
        let refcnt = &self.cache.ctrl[self.index].refcnt;
        let rc = refcnt.load(Ordering::Relaxed);
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        refcnt.store(rc - 1, Ordering::Relaxed);
        drop(bucket);
    }
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    /// 把缓冲块内容同步写回磁盘，调用者必须持有数据锁。
    pub fn bwrite(&mut self) {
        match self.data.as_mut() {
            Some(guard) if guard.holding() => {
                self.cache.disk.rw(self.dev, self.blockno, &mut **guard, true);
            }
            _ => panic!("bwrite"),
        }
    }
}

impl<'a, D> Deref for Buf<'a, D> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data_ref()
    }
}

impl<'a, D> DerefMut for Buf<'a, D> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data_mut()
    }
}

impl<'a, D> Drop for Buf<'a, D> {
    fn drop(&mut self) {
        match self.data.take() {
            Some(guard) if guard.holding() => drop(guard),
            _ => panic!("brelse"),
        }
        self.cache.brelse(self.index, self.blockno);
    }
}

/// 哈希桶：一条由槽位下标串起的单向链表，`NIL` 表示空。
struct Bucket {
    head: usize,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: NIL }
    }
}

/// 缓冲块控制结构，记录槽位绑定的块、引用计数与 LRU 时间戳。
///
/// 所有字段只在持有槽位所在桶的锁时访问。
struct BufCtrl {
    dev: AtomicU32,
    blockno: AtomicU32,

    /// 当前持有者数量，为 0 时可被回收。
    refcnt: AtomicUsize,

    /// 引用计数最近一次归零时的时钟滴答。
    timestamp: AtomicU64,

    /// 桶内链表的后继槽位下标。
    next: AtomicUsize,

    /// 当前所在桶的下标，尚未声明或迁移途中为 `NIL`。
    bucket: AtomicUsize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(0),
            refcnt: AtomicUsize::new(0),
            timestamp: AtomicU64::new(0),
            next: AtomicUsize::new(NIL),
            bucket: AtomicUsize::new(NIL),
        }
    }

    fn matches(&self, dev: u32, blockno: u32) -> bool {
        self.dev.load(Ordering::Relaxed) == dev && self.blockno.load(Ordering::Relaxed) == blockno
    }

    /// 重新绑定到新的块，引用计数置为 1。
    fn bind(&self, dev: u32, blockno: u32) {
        self.dev.store(dev, Ordering::Relaxed);
        self.blockno.store(blockno, Ordering::Relaxed);
        self.refcnt.store(1, Ordering::Relaxed);
    }
}

/// 缓冲块的数据部分及其有效性标志。
struct BufInner {
    /// 数据是否已从磁盘读入。
    ///
    /// 由 `bget` 在持有桶锁时清除，由 `bread` 在持有数据锁时读取与设置。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护。
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

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing;

    use std::sync::atomic::AtomicUsize;

    struct CountingDisk {
        reads: AtomicUsize,
    }

    impl BlockDevice for CountingDisk {
        fn rw(&self, _dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
            if !writing {
                self.reads.fetch_add(1, Ordering::Relaxed);
                data[0] = blockno as u8;
            }
        }
    }

    fn cache() -> Box<Bcache<CountingDisk>> {
        Box::new(Bcache::new(CountingDisk { reads: AtomicUsize::new(0) }))
    }

    #[test]
    fn hit_skips_disk_read() {
        testing::setup();
        let bcache = cache();
        drop(bcache.bread(1, 7));
        let b = bcache.bread(1, 7);
        assert_eq!(b[0], 7);
        assert_eq!(bcache.disk().reads.load(Ordering::Relaxed), 1);
        assert_eq!(bcache.claimed(), 1);
    }

    #[test]
    fn fresh_slots_are_claimed_in_order() {
        testing::setup();
        let bcache = cache();
        for blockno in 0..5 {
            let b = bcache.bread(1, blockno);
            assert_eq!(b.index(), blockno as usize);
        }
        assert_eq!(bcache.claimed(), 5);
    }

    #[test]
    fn release_stamps_only_when_unreferenced() {
        testing::setup();
        let bcache = cache();
        let b = bcache.bread(1, 3);
        b.pin();
        let index = b.index();
        drop(b);
        assert_eq!(bcache.ctrl[index].timestamp.load(Ordering::Relaxed), 0);
        assert_eq!(bcache.refcnt(1, 3), Some(1));

        let b = bcache.bread(1, 3);
        b.unpin();
        drop(b);
        assert_ne!(bcache.ctrl[index].timestamp.load(Ordering::Relaxed), 0);
        assert_eq!(bcache.refcnt(1, 3), Some(0));
    }

    #[test]
    fn move_rehashes_into_target_bucket() {
        testing::setup();
        let bcache = cache();
        // 所有槽位都落在桶 0 中
        for i in 0..NBUF as u32 {
            drop(bcache.bread(1, i * NBUCKET as u32));
        }
        // 桶 0 中最早释放的块 0 被回收并迁移到目标桶 1
        let target = 1u32;
        let b = bcache.bread(2, target);
        let index = b.index();
        assert_eq!(index, 0);
        assert_eq!(bcache.ctrl[index].bucket.load(Ordering::Relaxed), hash(target));
        drop(b);
        assert_eq!(bcache.refcnt(1, 0), None);
        assert_eq!(bcache.refcnt(2, target), Some(0));
        assert_eq!(bcache.bindings(2, target), 1);
    }

    #[test]
    #[should_panic(expected = "buf unpin not match")]
    fn unpin_without_pin_is_fatal() {
        testing::setup();
        let bcache = cache();
        let b = bcache.bread(1, 1);
        b.unpin();
    }
}
