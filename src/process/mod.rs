//! 进程与处理器接口
//!
//! 调度器本身不属于本 crate，这里只保留锁与分配器需要的处理器服务。

mod cpu;

pub use cpu::{Hart, CpuManager, install, push_off, pop_off, cpu_id};

#[cfg(test)]
pub(crate) use cpu::testing;
