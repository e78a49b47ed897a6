//! 处理器状态接口，用于获取当前 CPU 身份、控制中断开关以及进程休眠/唤醒

use conquer_once::spin::OnceCell;

use crate::spinlock::SpinLockGuard;

/// 由内核其余部分提供的硬件线程（hart）服务。
///
/// 块缓存与物理页分配器只依赖这里列出的能力：CPU 身份、进程身份、
/// 中断开关、基于通道的休眠/唤醒、时钟滴答以及控制台输出。
/// 调度器、陷入处理与串口驱动都位于本 crate 之外，
/// 由内核在启动早期通过 [`install`] 注册一个实现。
///
/// 实现必须是 `Sync` 的，因为所有 CPU 共享同一个实例。
pub trait Hart: Sync {
    /// 返回当前 CPU 的编号，取值范围为 `0..NCPU`。
    ///
    /// 调用者需在中断关闭时调用，以防止读取期间进程被迁移到另一个 CPU。
    fn cpu_id(&self) -> usize;

    /// 返回当前进程（线程）的标识，供睡眠锁检查持有者使用。
    fn pid(&self) -> usize;

    /// 关闭中断并增加嵌套计数。
    fn push_off(&self);

    /// 减少嵌套计数，计数归零且此前中断开启时重新开启中断。
    fn pop_off(&self);

    /// 在通道 `chan` 上休眠。
    ///
    /// 实现必须在进入休眠前释放 `guard`，且释放与休眠之间不能丢失唤醒。
    fn sleep(&self, chan: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在通道 `chan` 上休眠的进程。
    fn wakeup(&self, chan: usize);

    /// 当前的时钟滴答数。
    fn ticks(&self) -> u64;

    /// 向控制台输出一个字节。
    fn putc(&self, c: u8);
}

static HART: OnceCell<&'static dyn Hart> = OnceCell::uninit();

/// 注册全局 hart 服务。
///
/// 必须在任何锁被使用之前调用，且只能成功调用一次。
pub fn install(hart: &'static dyn Hart) -> Result<(), &'static str> {
    HART.try_init_once(|| hart)
        .map_err(|_| "hart already installed")
}

#[inline]
fn hart() -> &'static dyn Hart {
    match HART.try_get() {
        Ok(hart) => *hart,
        Err(_) => panic!("hart not installed"),
    }
}

/// CPU 管理器，为本 crate 提供对已注册 hart 的统一访问入口。
pub struct CpuManager;

impl CpuManager {
    /// 必须在禁用中断的情况下调用，
    /// 以防止与进程被迁移到另一个 CPU 时出现竞争条件。
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        hart().cpu_id()
    }

    /// 当前进程的标识。
    #[inline]
    pub fn pid() -> usize {
        hart().pid()
    }

    /// 在通道 `chan` 上休眠，进入休眠前释放 `guard`。
    pub fn sleep(chan: usize, guard: SpinLockGuard<'_, ()>) {
        hart().sleep(chan, guard);
    }

    /// 唤醒在通道 `chan` 上休眠的所有进程。
    pub fn wakeup(chan: usize) {
        hart().wakeup(chan);
    }

    /// 当前时钟滴答数。
    pub fn ticks() -> u64 {
        hart().ticks()
    }

    pub(crate) fn putc(c: u8) {
        hart().putc(c);
    }
}

/// 关闭中断，支持嵌套调用。
///
/// 与 [`pop_off`] 成对使用：两次 `push_off` 需要两次 `pop_off` 才能撤销；
/// 若最初中断已关闭，则成对调用后中断仍保持关闭。
pub fn push_off() {
    hart().push_off();
}

/// 撤销一次 [`push_off`]。
pub fn pop_off() {
    hart().pop_off();
}

/// 在中断关闭的情况下读取当前 CPU 编号。
///
/// 返回后进程可能已被迁移，结果仅作为选择每 CPU 数据结构的提示，
/// 调用者不能依赖其在之后仍然准确。
pub fn cpu_id() -> usize {
    push_off();
    let id = unsafe { CpuManager::cpu_id() };
    pop_off();
    id
}
