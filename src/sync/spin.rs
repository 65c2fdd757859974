//! 普通自旋锁。
//!
//! `SpinMutex<T>` 用一个 `AtomicBool` 的 test-and-set 实现互斥，
//! 用 RAII guard 在离开作用域时释放。`try_lock_for` / `try_lock_until`
//! 在每次自旋迭代中轮询时钟，超过截止时间即放弃。

use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// 忙等的互斥锁，保护一份内部数据 `T`。
///
/// 获取使用 acquire 语义的 test-and-set，释放使用 release 语义的清除，
/// 保证临界区内的写入对下一个持有者可见。
///
/// # 示例
///
/// ```
/// use httpool::sync::SpinMutex;
///
/// let m = SpinMutex::new(0u64);
/// *m.lock() += 1;
/// assert_eq!(*m.lock(), 1);
/// ```
pub struct SpinMutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// data 的访问被锁串行化，因此只要 T: Send 就可以跨线程共享
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}

/// [`SpinMutex::lock`] 返回的 RAII guard，drop 时释放锁。
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinMutex<T>,
}

impl<T> SpinMutex<T> {
    /// 创建一个未锁定的 `SpinMutex`。
    pub const fn new(data: T) -> Self {
        SpinMutex {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// 消费锁，取回内部数据。
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// 忙等直到获取锁。
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            // 自旋期间提示 CPU 降低流水线压力
            hint::spin_loop();
        }
        SpinGuard { lock: self }
    }

    /// 尝试获取锁，立即返回。
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinGuard { lock: self })
        }
    }

    /// 在 `timeout` 时限内尝试获取锁。
    pub fn try_lock_for(&self, timeout: Duration) -> Option<SpinGuard<'_, T>> {
        self.try_lock_until(Instant::now() + timeout)
    }

    /// 在截止时间 `deadline` 之前尝试获取锁，每次自旋都检查时钟。
    pub fn try_lock_until(&self, deadline: Instant) -> Option<SpinGuard<'_, T>> {
        while self.locked.swap(true, Ordering::Acquire) {
            if Instant::now() >= deadline {
                return None;
            }
            hint::spin_loop();
        }
        Some(SpinGuard { lock: self })
    }

    /// 独占访问时直接取内部数据，无需原子操作。
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 不阻塞地打印：拿不到锁时输出占位符
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinMutex").field("data", &&*guard).finish(),
            None => f.debug_struct("SpinMutex").field("data", &"<locked>").finish(),
        }
    }
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: guard 存在期间持有锁，访问被串行化
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: 同上
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
