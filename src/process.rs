//! 线程管理
//!
//! 为锁原语提供执行上下文的身份标识，以及基于通道（channel）的睡眠/唤醒机制。
//! 内核中由 CPU 与进程管理器承担的职责在这里由宿主线程的 park/unpark 完成。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, Thread};

use crate::spinlock::{SpinLock, SpinLockGuard};

/// 表示"没有线程"的标识，用于锁的持有者字段。
pub const NO_THREAD: usize = usize::MAX;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// 返回当前线程的唯一编号，在线程生命周期内保持不变。
#[inline]
pub fn thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

/// 睡眠在某个通道上的线程。
struct Sleeper {
    channel: usize,
    id: usize,
    thread: Thread,
}

/// 所有睡眠线程的等待表。
///
/// 锁顺序上它总是最内层的锁：调用 [`sleep`] 与 [`wakeup`] 时可以持有其他自旋锁。
static WAIT_TABLE: SpinLock<Vec<Sleeper>> = SpinLock::new(Vec::new(), "wait_table");

/// 在 `channel` 上睡眠，并原子地释放调用者持有的自旋锁。
///
/// # 功能说明
/// 先把当前线程登记到等待表，再释放 `guard`，最后挂起线程。
/// 由于登记发生在释放 `guard` 之前，对应的 [`wakeup`] 不会被错过：
/// 即使唤醒发生在挂起之前，`park` 也会立即返回。
///
/// # 注意
/// 返回并不保证等待的条件已经成立（可能是虚假唤醒），
/// 调用者必须重新获取锁并在循环中检查条件。
pub fn sleep<T: ?Sized>(channel: usize, guard: SpinLockGuard<'_, T>) {
    let id = thread_id();
    let mut table = WAIT_TABLE.lock();
    table.push(Sleeper {
        channel,
        id,
        thread: thread::current(),
    });
    drop(table);
    drop(guard);

    thread::park();

    // 虚假唤醒时自己的登记项可能还在
    WAIT_TABLE.lock().retain(|s| !(s.channel == channel && s.id == id));
}

/// 唤醒所有睡眠在 `channel` 上的线程。
pub fn wakeup(channel: usize) {
    let mut table = WAIT_TABLE.lock();
    table.retain(|s| {
        if s.channel == channel {
            s.thread.unpark();
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn thread_ids_are_distinct_and_stable() {
        let here = thread_id();
        assert_eq!(here, thread_id());
        let there = thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(there, NO_THREAD);
    }

    #[test]
    fn wakeup_releases_sleeper() {
        let lock = Arc::new(SpinLock::new(false, "cond"));
        let channel = Arc::as_ptr(&lock) as usize;
        let done = Arc::new(AtomicBool::new(false));

        let waiter = {
            let lock = Arc::clone(&lock);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut guard = lock.lock();
                while !*guard {
                    sleep(channel, guard);
                    guard = lock.lock();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut guard = lock.lock();
        *guard = true;
        wakeup(channel);
        drop(guard);

        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}
