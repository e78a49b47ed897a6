//! 内存管理模块

pub use addr::{Addr, PhysAddr};
pub use kalloc::Kmem;
pub use list::{Chain, FreeList};

mod addr;
pub mod kalloc;
mod list;
