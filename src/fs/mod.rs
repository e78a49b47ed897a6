//! 文件系统的块缓存层
//!
//! 磁盘布局、日志与 inode 层位于本 crate 之外，它们通过 [`Bcache`] 读写磁盘块。

mod bio;

pub use bio::{Bcache, BlockDevice, Buf, BufData};
