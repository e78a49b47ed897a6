//! 物理页分配器
//!
//! 每个 CPU 拥有一条由自旋锁保护的空闲页链表，分配与回收都只访问本地链表。
//! 本地链表为空时，按轮转顺序从其他 CPU 的链表中偷取一半空闲页。
//! 空闲页自身的前几个字节用来存放链表链接。

use array_macro::array;

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::{KALLOC_JUNK, KFREE_JUNK, NCPU, PGSIZE};
use crate::process::cpu_id;
use crate::spinlock::SpinLock;
use super::addr::{Addr, PhysAddr};
use super::list::{Chain, FreeList};

/// 存放在空闲页开头的链接
#[repr(C)]
struct Run {
    next: Option<usize>,
}

/// 以空闲页自身的内存存放链表链接的 [`Chain`] 实现。
struct Frames(());

impl Frames {
    /// # 安全性
    /// 之后交给 `Chain` 方法的每个节点都必须是一页由调用者独占的空闲物理页：
    /// 要么位于调用者当前持锁的空闲链表中，要么位于已从链表摘下、只有调用者可见的链中。
    unsafe fn new() -> Self {
        Frames(())
    }
}

impl Chain for Frames {
    fn next(&self, node: usize) -> Option<usize> {
        // SAFETY: `Frames::new` 的约定保证 `node` 是调用者独占的空闲页，
        // 页对齐且足够容纳一个 `Run`。
        unsafe { ptr::read(node as *const Run).next }
    }

    fn set_next(&mut self, node: usize, next: Option<usize>) {
        // SAFETY: 同上，空闲页的开头只用来存放链接，覆盖它不会影响其他数据。
        unsafe { ptr::write(node as *mut Run, Run { next }) }
    }
}

/// 每 CPU 物理页分配器。
///
/// 在调用 [`Kmem::kinit`] 交付物理内存之前，分配总是返回 `None`。
///
/// # 锁的顺序
/// 分配与回收在任意时刻最多持有一把链表锁：
/// 偷取前先释放本地链表锁，逐个获取受害者的锁，拆分完成后释放，
/// 再重新获取本地锁放入剩余页面，因此不存在循环等待。
pub struct Kmem {
    lists: [SpinLock<FreeList>; NCPU],
    start: AtomicUsize,
    end: AtomicUsize,
}

impl Kmem {
    pub const fn uninit() -> Self {
        Self {
            lists: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }

    /// 初始化物理页分配器。
    ///
    /// # 功能说明
    /// 把 `[start, end)` 中所有完整的物理页交给分配器管理：
    /// `start` 向上、`end` 向下取整到页边界，之后逐页调用 `kfree`，
    /// 所有页面都进入当前 CPU 的空闲链表，其他 CPU 在首次分配时通过偷取获得页面。
    /// 两端不完整的页不归分配器管理，之后回收它们会 panic。
    ///
    /// # 安全性
    /// - 区间内的内存必须有效、可写，且此后只归分配器所有；
    /// - 只能调用一次，并且必须在其他 CPU 使用分配器之前完成。
    pub unsafe fn kinit(&self, start: usize, end: usize) {
        let mut pa = PhysAddr::from_raw(start);
        pa.pg_round_up();
        let mut top = PhysAddr::from_raw(end);
        top.pg_round_down();
        let end = top.as_usize().max(pa.as_usize());
        self.start.store(pa.as_usize(), Ordering::Relaxed);
        self.end.store(end, Ordering::Relaxed);

        #[cfg(feature = "verbose_init_info")]
        println!("kalloc: available phys memory [{:#x}, {:#x})", pa.as_usize(), end);

        self.free_range(pa, end);

        #[cfg(feature = "verbose_init_info")]
        println!("kalloc: init memory done, {} pages", self.total_free());
    }

    unsafe fn free_range(&self, mut pa: PhysAddr, end: usize) {
        while pa.as_usize() + PGSIZE <= end {
            self.kfree(pa);
            pa.add_page();
        }
    }

    /// 受管理的物理地址区间 `[start, end)`。
    pub fn range(&self) -> (usize, usize) {
        (self.start.load(Ordering::Relaxed), self.end.load(Ordering::Relaxed))
    }

    /// 回收一页物理内存。
    ///
    /// # 功能说明
    /// 检查地址后用 `KFREE_JUNK` 填满整页以暴露悬垂引用，
    /// 然后放入当前 CPU 的空闲链表。回收从不把页面放到其他 CPU 的链表上，
    /// 负载均衡交由分配时的偷取完成。
    ///
    /// # 可能的错误
    /// 地址未页对齐或不在受管理区间内时 panic（`"kfree"`）。
    ///
    /// # 安全性
    /// `pa` 必须是此前由 `kalloc` 返回（或初始化时交付）的页面，
    /// 调用之后调用者不得再访问该页。
    pub unsafe fn kfree(&self, mut pa: PhysAddr) {
        let (start, end) = self.range();
        if !pa.is_page_aligned() || pa.as_usize() < start || pa.as_usize() >= end {
            panic!("kfree");
        }

        ptr::write_bytes(pa.as_mut_ptr(), KFREE_JUNK, PGSIZE);

        let cpu = self.my_cpu();
        let mut frames = Frames::new();
        let mut list = self.lists[cpu].lock();
        list.push(&mut frames, pa.into_raw());
        drop(list);
    }

    /// 分配一页物理内存。
    ///
    /// # 流程解释
    /// 1. 读取当前 CPU 编号，从本地空闲链表弹出一页；
    /// 2. 本地链表为空时调用 `steal` 从其他 CPU 偷取一半空闲页，
    ///    取走其中一页，其余放入本地链表；
    /// 3. 成功时用 `KALLOC_JUNK` 填满整页以暴露未初始化读取。
    ///
    /// # 返回值
    /// 所有 CPU 都没有空闲页时返回 `None`，由调用者决定如何处理。
    pub fn kalloc(&self) -> Option<PhysAddr> {
        let cpu = self.my_cpu();
        let mut frames = unsafe { Frames::new() };

        let mut list = self.lists[cpu].lock();
        let page = list.pop(&frames);
        drop(list);

        match page.or_else(|| self.steal(cpu, &mut frames)) {
            // SAFETY: 页面已从所有链表中摘下，只归本次分配所有
            Some(raw) => unsafe {
                let mut pa = PhysAddr::from_raw(raw);
                ptr::write_bytes(pa.as_mut_ptr(), KALLOC_JUNK, PGSIZE);
                Some(pa)
            },
            None => {
                #[cfg(feature = "kernel_warning")]
                println!("kalloc: out of memory on hart {}", cpu);
                None
            }
        }
    }

    /// 从其他 CPU 的空闲链表中偷取一半空闲页。
    ///
    /// # 流程解释
    /// - 从 `cpu` 的下一个 CPU 开始轮转，跳过自身；
    /// - 每次只持有一个受害者的锁，链表非空时用快慢指针拆分，
    ///   受害者保留前一半（向上取整），后一半被摘下；
    /// - 释放受害者的锁后，从摘下的链中取一页返回，
    ///   其余页面在加锁前求出尾节点，然后接到本地链表的头部。
    ///   本地链表此时可能已被同一 CPU 上的 `kfree` 放入了新页，接入时保留它们。
    fn steal(&self, cpu: usize, frames: &mut Frames) -> Option<usize> {
        let mut c = cpu;
        for _ in 1..NCPU {
            c = (c + 1) % NCPU;

            let mut victim = self.lists[c].lock();
            if victim.is_empty() {
                drop(victim);
                continue;
            }
            let mut stolen = victim.split_half(frames);
            drop(victim);

            let page = stolen.pop(frames);
            if let Some(tail) = stolen.tail(frames) {
                let mut local = self.lists[cpu].lock();
                local.splice(frames, stolen, tail);
                drop(local);
            }
            return page;
        }
        None
    }

    /// 指定 CPU 空闲链表中的页数。
    pub fn free_pages(&self, cpu: usize) -> usize {
        self.lists[cpu].lock().len()
    }

    /// 所有 CPU 空闲链表中的页数之和。
    ///
    /// 逐个链表加锁统计，只在静止时刻是准确的快照。
    pub fn total_free(&self) -> usize {
        self.lists.iter().map(|list| list.lock().len()).sum()
    }

    fn my_cpu(&self) -> usize {
        let cpu = cpu_id();
        if cpu >= NCPU {
            panic!("kmem: cpu {} out of range", cpu);
        }
        cpu
    }
}


/// 多核测试（在内核中每个 hart 上同时执行）
#[cfg(feature = "unit_test")]
pub mod kernel_tests {
    use super::*;

    /// 所有 hart 同时分配、校验并回收页面。
    pub fn alloc_simo(kmem: &Kmem) {
        static NSMP: AtomicUsize = AtomicUsize::new(0);
        NSMP.fetch_add(1, Ordering::Relaxed);
        while NSMP.load(Ordering::Relaxed) != NCPU {}

        let id = cpu_id();
        let mut pages = [None; 10];
        for slot in pages.iter_mut() {
            *slot = kmem.kalloc();
            if let Some(pa) = slot {
                let first = unsafe { ptr::read(pa.as_ptr()) };
                if first != KALLOC_JUNK {
                    panic!("alloc_simo: page {:#x} not filled", pa.as_usize());
                }
                println!("hart {} alloc page at {:#x}", id, pa.as_usize());
            }
        }
        for pa in pages.iter().flatten() {
            unsafe { kmem.kfree(*pa) };
        }

        NSMP.fetch_sub(1, Ordering::Relaxed);
        while NSMP.load(Ordering::Relaxed) != 0 {}
    }
}
