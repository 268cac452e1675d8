//! 内存盘
//!
//! 以 `(dev, blockno)` 为键保存块内容，未写过的块读出全零。
//! 记录读写次数，便于观察缓存层实际发出的 I/O。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::fs::BufData;
use crate::spinlock::SpinLock;
use super::BlockDevice;

pub struct RamDisk {
    blocks: SpinLock<HashMap<(u32, u32), BufData>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// 创建一个空的内存盘，所有块读出全零，读写计数从零开始。
    pub fn new() -> Self {
        Self {
            blocks: SpinLock::new(HashMap::new(), "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 设备读次数。
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 设备写次数。
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 不经过计数直接查看设备上的块内容，未写过的块返回 `None`。
    pub fn block(&self, dev: u32, blockno: u32) -> Option<BufData> {
        self.blocks.lock().get(&(dev, blockno)).cloned()
    }

    /// 不经过计数直接设置设备上的块内容，用于预置磁盘镜像。
    pub fn fill(&self, dev: u32, blockno: u32, data: &BufData) {
        self.blocks.lock().insert((dev, blockno), data.clone());
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        trace!("ramdisk: read dev {} block {}", dev, blockno);
        match self.blocks.lock().get(&(dev, blockno)) {
            Some(block) => data.copy_from(block),
            None => data.fill(0),
        }
    }

    fn write(&self, dev: u32, blockno: u32, data: &BufData) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!("ramdisk: write dev {} block {}", dev, blockno);
        self.blocks.lock().insert((dev, blockno), data.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_block_reads_zero() {
        let disk = RamDisk::new();
        let mut data = BufData::new();
        data.fill(0xaa);
        disk.read(1, 7, &mut data);
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(disk.reads(), 1);
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    fn write_then_read_back() {
        let disk = RamDisk::new();
        let mut data = BufData::new();
        data[0] = 1;
        data[1023] = 2;
        disk.write(2, 9, &data);

        let mut back = BufData::new();
        disk.read(2, 9, &mut back);
        assert_eq!(back[0], 1);
        assert_eq!(back[1023], 2);
        assert!(disk.block(2, 8).is_none());
        assert!(disk.block(1, 9).is_none());
        assert_eq!(disk.writes(), 1);
    }
}
