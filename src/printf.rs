//! 诊断输出
//!
//! `print!`/`println!` 把格式化文本逐字节交给 [`Hart::putc`](crate::process::Hart::putc)。
//! 分配器在 `verbose_init_info` 下报告受管理的内存范围，
//! 在 `kernel_warning` 下报告分配失败；块缓存在 `kernel_warning` 下报告槽位跨桶迁移。

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::process::CpuManager;
use crate::spinlock::SpinLock;

/// 用于表示是否有任何硬件线程触发了 panic。
static PANICKED: AtomicBool = AtomicBool::new(false);

/// 经由已注册 hart 输出的 `fmt::Write` 实现。
struct Print;

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            CpuManager::putc(byte);
        }
        Ok(())
    }
}

/// 核心打印函数（被宏调用）
///
/// # 功能说明
/// 根据系统状态决定是否加锁输出：
/// - 当系统处于panic状态时，直接输出（不加锁），避免持锁的 hart 已崩溃导致死锁
/// - 正常状态下使用自旋锁保证多核输出不交错
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    if PANICKED.load(Ordering::Relaxed) {
        // no need to lock
        let _ = Print.write_fmt(args);
    } else {
        let guard = PRINT.lock();
        let _ = Print.write_fmt(args);
        drop(guard);
    }
}

/// 由内核的 panic 处理函数调用，此后输出不再加锁。
pub fn mark_panicked() {
    PANICKED.store(true, Ordering::Relaxed);
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}
