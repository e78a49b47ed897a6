//! xv6-rust 内核中面向多核扩展的两个资源管理器：
//! 分桶的磁盘块缓存（[`fs::Bcache`]）与带偷取回退的每 CPU 物理页分配器（[`mm::Kmem`]）。
//!
//! 调度、陷入处理和设备驱动由内核的其余部分提供，
//! 启动时通过 [`process::install`] 注册一个 [`process::Hart`] 实现。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
pub mod printf;

pub mod consts;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

/// 内核自测入口，由每个 hart 在初始化完成后调用。
#[cfg(feature = "unit_test")]
pub fn test_main_entry(kmem: &mm::Kmem) {
    let cpu_id = process::cpu_id();

    // 只需要在单个硬件线程 / 内核线程上执行的测试用例
    if cpu_id == 0 {
        spinlock::kernel_tests::smoke();
    }

    // 需要在多个硬件线程 / 内核线程上执行的测试用例
    mm::kalloc::kernel_tests::alloc_simo(kmem);

    if cpu_id == 0 {
        println!("all tests pass.");
    }
}
