//! 读写自旋锁。
//!
//! 单个计数器编码全部状态：`0` 空闲，`1..MAX-1` 为并发读者数，
//! `u32::MAX` 为写者哨兵。哨兵必须大于任何可能的读者数量，
//! 取无符号最大值是自然选择。

use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// 写者哨兵值。
const EXCLUSIVE: u32 = u32::MAX;

/// 忙等的读写锁，保护一份内部数据 `T`。
///
/// 允许至多 `u32::MAX - 1` 个并发读者；写者独占。
///
/// # 示例
///
/// ```
/// use httpool::sync::SharedMutex;
///
/// let m = SharedMutex::new(5);
/// {
///     let r1 = m.read();
///     let r2 = m.read(); // 多个读者可以共存
///     assert_eq!(*r1 + *r2, 10);
/// }
/// *m.write() = 6;
/// ```
pub struct SharedMutex<T: ?Sized> {
    count: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

/// 共享（读）guard，drop 时递减读者计数。
pub struct SharedReadGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

/// 独占（写）guard，drop 时清空哨兵。
pub struct SharedWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T> SharedMutex<T> {
    /// 创建一个未锁定的 `SharedMutex`。
    pub const fn new(data: T) -> Self {
        SharedMutex {
            count: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// 消费锁，取回内部数据。
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    /// 忙等直到获得独占访问。
    pub fn write(&self) -> SharedWriteGuard<'_, T> {
        while self
            .count
            .compare_exchange_weak(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        SharedWriteGuard { lock: self }
    }

    /// 尝试获得独占访问，立即返回。
    pub fn try_write(&self) -> Option<SharedWriteGuard<'_, T>> {
        self.count
            .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SharedWriteGuard { lock: self })
    }

    /// 在 `timeout` 时限内尝试获得独占访问。
    pub fn try_write_for(&self, timeout: Duration) -> Option<SharedWriteGuard<'_, T>> {
        self.try_write_until(Instant::now() + timeout)
    }

    /// 在截止时间之前尝试获得独占访问。
    pub fn try_write_until(&self, deadline: Instant) -> Option<SharedWriteGuard<'_, T>> {
        while self
            .count
            .compare_exchange_weak(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if Instant::now() >= deadline {
                return None;
            }
            hint::spin_loop();
        }
        Some(SharedWriteGuard { lock: self })
    }

    /// 忙等直到获得共享访问。
    pub fn read(&self) -> SharedReadGuard<'_, T> {
        let mut expected = 0;
        loop {
            // 写者在场时从 0 重新竞争
            if expected == EXCLUSIVE {
                expected = 0;
            }
            match self.count.compare_exchange_weak(
                expected,
                expected + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return SharedReadGuard { lock: self },
                Err(current) => {
                    expected = current;
                    hint::spin_loop();
                }
            }
        }
    }

    /// 尝试获得共享访问，立即返回。
    pub fn try_read(&self) -> Option<SharedReadGuard<'_, T>> {
        let current = self.count.load(Ordering::Relaxed);
        if current == EXCLUSIVE {
            return None;
        }
        self.count
            .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SharedReadGuard { lock: self })
    }

    /// 在 `timeout` 时限内尝试获得共享访问。
    pub fn try_read_for(&self, timeout: Duration) -> Option<SharedReadGuard<'_, T>> {
        self.try_read_until(Instant::now() + timeout)
    }

    /// 在截止时间之前尝试获得共享访问。
    pub fn try_read_until(&self, deadline: Instant) -> Option<SharedReadGuard<'_, T>> {
        let mut expected = 0;
        loop {
            if Instant::now() >= deadline {
                return None;
            }
            if expected == EXCLUSIVE {
                expected = 0;
            }
            match self.count.compare_exchange_weak(
                expected,
                expected + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SharedReadGuard { lock: self }),
                Err(current) => {
                    expected = current;
                    hint::spin_loop();
                }
            }
        }
    }

    /// 独占访问时直接取内部数据。
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("SharedMutex").field("data", &&*guard).finish(),
            None => f
                .debug_struct("SharedMutex")
                .field("data", &"<write locked>")
                .finish(),
        }
    }
}

impl<T: ?Sized> Deref for SharedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: 读者在场时写者无法进入，只读访问安全
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedReadGuard<'_, T> {
    fn drop(&mut self) {
        let prev = self.lock.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0 && prev != EXCLUSIVE);
    }
}

impl<T: ?Sized> Deref for SharedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: 持有写哨兵，访问独占
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: 同上
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedWriteGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.lock.count.load(Ordering::Relaxed), EXCLUSIVE);
        self.lock.count.store(0, Ordering::Release);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_coexist_writer_excludes() {
        let m = SharedMutex::new(1u32);

        let r1 = m.read();
        let r2 = m.read();
        assert_eq!(*r1, 1);
        assert_eq!(*r2, 1);
        // 读者在场，写者进不来
        assert!(m.try_write().is_none());
        drop(r1);
        drop(r2);

        let w = m.write();
        assert!(m.try_read().is_none());
        assert!(m.try_read_for(Duration::from_millis(2)).is_none());
        drop(w);
        assert!(m.try_read().is_some());
    }

    #[test]
    fn mixed_read_write_stress() {
        let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let m = Arc::new(SharedMutex::new(vec![0u64; 8]));

        let handles: Vec<_> = (0..threads)
            .map(|seed| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        if (i + seed as u64) % 3 == 0 {
                            let mut w = m.write();
                            let base = i % 11;
                            for (j, v) in w.iter_mut().enumerate() {
                                *v = base * j as u64;
                            }
                        } else {
                            let r = m.read();
                            let base = r[1];
                            // 任何读者观察到的都必须是完整的一次写入
                            for (j, v) in r.iter().enumerate() {
                                assert_eq!(*v, base * j as u64);
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
