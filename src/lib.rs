//! 分片 LRU 块缓存
//!
//! 内核存储栈中位于块设备驱动与文件系统/日志之间的缓冲层：
//! 固定数量的缓冲块保存磁盘块的内存副本，按块号哈希到若干个桶，
//! 每个桶由各自的自旋锁保护，每个缓冲块的数据由睡眠锁保护。
//!
//! ```no_run
//! use xv6_bio::{Bcache, RamDisk, Ticks};
//!
//! let cache = Bcache::new(RamDisk::new(), Ticks::new());
//! let mut buf = cache.bread(1, 33);
//! buf.data_mut()[0] = 7;
//! buf.bwrite();
//! buf.brelse();
//! ```

#![warn(rust_2018_idioms)]

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;
pub mod trap;

pub use consts::{BSIZE, NBUCKET, NBUF};
pub use driver::{BlockDevice, RamDisk};
pub use fs::{Bcache, Buf, BufData};
pub use trap::{Clock, Ticks};
