//! 集成测试共用的宿主机环境：线程即 CPU 的 hart、内存磁盘与页对齐的“物理内存”。

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use xv6_lock::consts::fs::BSIZE;
use xv6_lock::consts::{NCPU, PGSIZE};
use xv6_lock::fs::{BlockDevice, BufData};
use xv6_lock::process::{self, Hart};
use xv6_lock::spinlock::SpinLockGuard;

static NEXT_ID: AtomicUsize = AtomicUsize::new(NCPU);
static TICKS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CPU: Cell<Option<usize>> = Cell::new(None);
    static PID: Cell<Option<usize>> = Cell::new(None);
}

fn thread_id(slot: &'static std::thread::LocalKey<Cell<Option<usize>>>) -> usize {
    slot.with(|id| match id.get() {
        Some(id) => id,
        None => {
            let fresh = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            id.set(Some(fresh));
            fresh
        }
    })
}

/// 每个线程视为一个独立的 CPU；休眠退化为让出时间片。
pub struct HostHart;

impl Hart for HostHart {
    fn cpu_id(&self) -> usize {
        thread_id(&CPU)
    }

    fn pid(&self) -> usize {
        thread_id(&PID)
    }

    fn push_off(&self) {}

    fn pop_off(&self) {}

    fn sleep(&self, _chan: usize, guard: SpinLockGuard<'_, ()>) {
        drop(guard);
        std::thread::yield_now();
    }

    fn wakeup(&self, _chan: usize) {}

    fn ticks(&self) -> u64 {
        TICKS.fetch_add(1, Ordering::Relaxed)
    }

    fn putc(&self, c: u8) {
        eprint!("{}", c as char);
    }
}

static HOST: HostHart = HostHart;

/// 注册宿主机 hart，当前线程使用自动分配的编号（不小于 `NCPU`）。
pub fn setup() {
    let _ = process::install(&HOST);
}

/// 注册宿主机 hart，并把当前线程绑定到 `cpu`。
pub fn bind_cpu(cpu: usize) {
    setup();
    CPU.with(|id| id.set(Some(cpu)));
}

/// 内存中的磁盘，记录每个块被读写的次数。
#[derive(Default)]
pub struct MemDisk {
    blocks: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    reads: Mutex<HashMap<(u32, u32), usize>>,
    total_reads: AtomicUsize,
    total_writes: AtomicUsize,
}

impl MemDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> usize {
        self.total_reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.total_writes.load(Ordering::SeqCst)
    }

    pub fn reads_of(&self, dev: u32, blockno: u32) -> usize {
        self.reads.lock().unwrap().get(&(dev, blockno)).copied().unwrap_or(0)
    }

    /// 磁盘上块的内容，从未写过的块全为零。
    pub fn block(&self, dev: u32, blockno: u32) -> Vec<u8> {
        self.blocks.lock().unwrap()
            .get(&(dev, blockno))
            .cloned()
            .unwrap_or_else(|| vec![0; BSIZE])
    }
}

impl BlockDevice for MemDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        if writing {
            self.total_writes.fetch_add(1, Ordering::SeqCst);
            self.blocks.lock().unwrap().insert((dev, blockno), data.to_vec());
        } else {
            self.total_reads.fetch_add(1, Ordering::SeqCst);
            *self.reads.lock().unwrap().entry((dev, blockno)).or_insert(0) += 1;
            let block = self.block(dev, blockno);
            data.copy_from_slice(&block);
        }
    }
}

/// 按页对齐的宿主机内存，充当物理内存。
pub struct Phys {
    base: *mut u8,
    layout: Layout,
}

unsafe impl Send for Phys {}
unsafe impl Sync for Phys {}

impl Phys {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    pub fn start(&self) -> usize {
        self.base as usize
    }

    pub fn end(&self) -> usize {
        self.base as usize + self.layout.size()
    }
}

impl Drop for Phys {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}
