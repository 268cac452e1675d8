//! 睡眠锁模块
//! 提供基于线程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会进入休眠状态，避免忙等待。

use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{self, NO_THREAD};
use crate::spinlock::SpinLock;

/// 睡眠锁，保护可能被长时间持有的数据（例如缓冲块内容）。
///
/// # 字段说明
/// - `lock`: 保护 `locked` 与 `owner` 的内部自旋锁；
/// - `locked`: 锁是否已被占用，其地址同时作为睡眠/唤醒的通道；
/// - `owner`: 持有者线程 ID，仅在 `locked` 为真时有意义；
/// - `name`: 锁的名称，用于调试；
/// - `data`: 被保护的数据。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    owner: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
// `locked` 与 `owner` 只在持有内部自旋锁时访问
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁
    ///
    /// # 参数
    /// - `data`: 被保护的初始数据；
    /// - `name`: 锁的名称，出现在误用时的 panic 信息中。
    ///
    /// # 返回值
    /// 处于未加锁状态的睡眠锁，可在 `const` 上下文中构造。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            owner: Cell::new(NO_THREAD),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，锁被占用时当前线程休眠直到被唤醒。
    ///
    /// # 功能说明
    /// 持有内部自旋锁检查 `locked`，若已被占用则在 `locked` 的地址上睡眠，
    /// 睡眠会同时释放内部自旋锁；被唤醒后重新获取内部锁并再次检查。
    /// 成功后记录持有者并释放内部自旋锁，返回守卫对象。
    ///
    /// # 注意
    /// 没有超时或取消机制，持有者不释放锁则等待者一直休眠。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            process::sleep(self.channel(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.owner.set(process::thread_id());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 当前线程是否持有该睡眠锁。
    pub fn holding(&self) -> bool {
        let _guard = self.lock.lock();
        self.locked.get() && self.owner.get() == process::thread_id()
    }

    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.get() || self.owner.get() != process::thread_id() {
            panic!("sleeplock {} release", self.name);
        }
        self.locked.set(false);
        self.owner.set(NO_THREAD);
        process::wakeup(self.channel());
        drop(guard);
    }

    fn channel(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，析构时释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
