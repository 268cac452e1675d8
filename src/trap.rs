//! 时钟节拍
//!
//! 缓存层只把节拍当作"最近一次释放"的先后顺序，不关心其频率和单位。

use core::num::Wrapping;

use crate::spinlock::SpinLock;

/// 单调不减的节拍源。
///
/// 实现必须可以在持有自旋锁时调用：读取不能阻塞或睡眠。
pub trait Clock: Send + Sync {
    /// 当前节拍数。
    fn ticks(&self) -> usize;
}

/// 由时钟中断推进的节拍计数器（自旋锁保护）。
pub struct Ticks {
    count: SpinLock<Wrapping<usize>>,
}

impl Ticks {
    pub const fn new() -> Self {
        Self {
            count: SpinLock::new(Wrapping(0), "time"),
        }
    }

    /// 处理时钟中断（更新计数器）
    ///
    /// # 功能说明
    /// 增加时钟计数，由时钟中断处理程序（或宿主环境中的定时线程）调用。
    pub fn clock_intr(&self) {
        let mut guard = self.count.lock();
        *guard += Wrapping(1);
    }

    /// 读取当前时钟计数值
    pub fn clock_read(&self) -> usize {
        self.count.lock().0
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for Ticks {
    fn ticks(&self) -> usize {
        self.clock_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let ticks = Ticks::new();
        assert_eq!(ticks.ticks(), 0);
        ticks.clock_intr();
        ticks.clock_intr();
        assert_eq!(ticks.ticks(), 2);
    }
}
