//! 内核核心使用的编译期常量

/// 系统支持的最大 CPU（hart）数量，每个 CPU 拥有一条独立的空闲页链表。
pub const NCPU: usize = 8;

/// 物理页大小（字节）。
pub const PGSIZE: usize = 4096;

/// 页内偏移所占的位数。
pub const PGSHIFT: usize = 12;

/// `kfree` 回收页面时写入的填充字节，用于尽早暴露悬垂引用。
pub const KFREE_JUNK: u8 = 0x01;

/// `kalloc` 分配页面时写入的填充字节，用于暴露未初始化读取。
pub const KALLOC_JUNK: u8 = 0x05;

pub mod fs {
    /// 块缓存中的缓冲块数量。
    pub const NBUF: usize = 30;

    /// 哈希桶数量，取素数以使块号分布更均匀。
    pub const NBUCKET: usize = 13;

    /// 磁盘块大小（字节）。
    pub const BSIZE: usize = 1024;
}
