//! 睡眠锁
//!
//! 块缓存中每个缓冲块的数据各由一把睡眠锁保护：持有者可能在等待磁盘传输，
//! 其他想访问同一块的进程通过 [`Hart::sleep`](crate::process::Hart::sleep) 让出 CPU，
//! 而不是自旋。锁记录持有者的进程标识，`bwrite` 与 `brelse` 据此检查调用者。

use core::ops::{Deref, DerefMut, Drop};
use core::cell::{Cell, UnsafeCell};

use crate::process::CpuManager;
use crate::spinlock::SpinLock;

/// 睡眠锁，等待者休眠直到持有者释放。
///
/// `locked` 与 `pid` 只在持有内部自旋锁 `lock` 时读写；
/// 锁的名称交给内部自旋锁，出错时出现在它的 panic 信息中。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    pid: Cell<usize>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), name),
            locked: Cell::new(false),
            pid: Cell::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前进程休眠，休眠时内部自旋锁被释放
    ///   - 如果未锁定：设置`locked=true`，记录持有者
    /// 3. 释放内部自旋锁并返回守卫
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            CpuManager::sleep(self.chan(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.pid.set(CpuManager::pid());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 当前进程是否持有此锁。
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let holding = self.locked.get() && self.pid.get() == CpuManager::pid();
        drop(guard);
        holding
    }

    /// 释放锁（内部方法，由守卫的Drop调用），并唤醒等待该锁的进程
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.pid.set(0);
        CpuManager::wakeup(self.chan());
        drop(guard);
    }

    /// 休眠通道：以`locked`字段的地址区分不同的锁
    fn chan(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前进程是否仍是该锁的持有者。
    ///
    /// 守卫被转移到另一个进程后返回 `false`。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
