//! 设备驱动模块：块设备接口与内存盘实现

use crate::fs::BufData;

mod ramdisk;

pub use ramdisk::RamDisk;

/// 块设备驱动接口。
///
/// 读写以 `BSIZE` 字节的整块为单位，对缓存层来说是同步完成的：
/// 方法返回时数据已经读入 `data` 或已经交给设备。
/// 缓存层只会在持有对应缓冲块的睡眠锁、且不持有任何自旋锁时调用它们。
pub trait BlockDevice: Send + Sync {
    /// 把设备 `dev` 上的块 `blockno` 读入 `data`。
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData);

    /// 把 `data` 写到设备 `dev` 上的块 `blockno`。
    fn write(&self, dev: u32, blockno: u32, data: &BufData);
}
