//! 自旋锁
//!
//! 块缓存的桶锁、回收锁、声明计数锁，每 CPU 空闲链表锁，
//! 以及睡眠锁内部保护状态的锁都是这里的 [`SpinLock`]。
//! 持锁期间通过 [`push_off`] 关闭中断，临界区内不得休眠。
//! 同一 CPU 重复获取或由非持有者释放都会 panic，信息中带有锁名。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{CpuManager, pop_off, push_off};

/// 带名称的测试并设置锁，数据包裹在锁内部，只能经由守卫访问。
///
/// `cpuid` 记录持有者的 CPU 编号（-1 表示空闲），用于检查重入与错误释放。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回守卫，守卫离开作用域时释放锁并恢复中断状态。
    ///
    /// # 流程解释
    /// 1. `push_off()` 关闭中断，避免持锁时被同一 CPU 上的中断处理重入；
    /// 2. 当前 CPU 已持有此锁时 panic；
    /// 3. 忙等待直到比较交换成功，随后用内存屏障隔开临界区；
    /// 4. 记录持有者 CPU 编号。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前CPU是否持有此锁。
    ///
    /// # 安全性
    /// 必须在禁用中断的上下文中调用，否则读取到的CPU ID可能在返回前失效。
    unsafe fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == CpuManager::cpu_id() as isize
    }

    fn acquire(&self) {
        push_off();
        if unsafe { self.holding() } {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(unsafe { CpuManager::cpu_id() } as isize, Ordering::Relaxed);
    }

    fn release(&self) {
        if unsafe { !self.holding() } {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，并恢复中断状态。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}


/// 多核测试（在内核中每个 hart 上执行）
#[cfg(feature = "unit_test")]
pub mod kernel_tests {
    use super::*;

    /// 基础功能测试：验证锁的获取和释放。
    pub fn smoke() {
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }
}
