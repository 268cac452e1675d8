//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::hint;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::process::{self, NO_THREAD};

/// 表示一个自旋锁结构，用于在多线程环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的线程将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的线程 ID，用于检测重入与错误释放。
///
/// 持有自旋锁期间不得睡眠或执行 I/O。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `owner`: 当前持有锁的线程 ID（`NO_THREAD` 表示无线程持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            owner: AtomicUsize::new(NO_THREAD),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 忙等待直到获得锁，返回的守卫在离开作用域时自动释放锁。
    ///
    /// # 可能的错误
    /// 当前线程已持有该锁时再次获取会 panic（自旋锁不可重入）。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        self.guard()
    }

    /// 尝试获取自旋锁，锁已被其他线程持有时立即返回 `None`。
    ///
    /// 与 [`lock`](Self::lock) 相同，当前线程已持有该锁时会 panic。
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        if self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            return None;
        }
        fence(Ordering::SeqCst);
        self.owner.store(process::thread_id(), Ordering::Relaxed);
        Some(self.guard())
    }

    /// 当前线程是否持有该锁。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == process::thread_id()
    }

    fn guard(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    fn acquire(&self) {
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.owner.store(process::thread_id(), Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.owner.store(NO_THREAD, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
    }
}

/// 自旋锁守卫，持有期间独占访问被保护的数据，析构时释放锁。
///
/// 守卫不能跨线程转移，锁的持有者始终是获取它的线程。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    #[should_panic(expected = "spinlock smoke acquire")]
    fn smoke() {
        let m = SpinLock::new((), "smoke");
        let _guard = m.lock();
        m.lock();
    }

    #[test]
    fn guard_releases_on_drop() {
        let m = SpinLock::new(0, "drop");
        {
            let mut guard = m.lock();
            *guard += 1;
            assert!(m.holding());
        }
        assert!(!m.holding());
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held_elsewhere() {
        let m = Arc::new(SpinLock::new((), "try"));
        let guard = m.lock();

        let other = Arc::clone(&m);
        let got = thread::spawn(move || other.try_lock().is_some())
            .join()
            .unwrap();
        assert!(!got);

        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn counter_under_contention() {
        let m = Arc::new(SpinLock::new(0usize, "counter"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 8000);
    }
}
