//! 可重入自旋锁。
//!
//! 按线程计数：同一线程重复获取只递增深度，不做额外的原子 RMW；
//! 深度归零时以 release 语义清空持有者，其他线程方可竞争。

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 进程内单调递增的线程编号，0 保留为"无持有者"。
///
/// 不使用 `std::thread::ThreadId`，因为它无法放进原子变量。
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// 可重入的忙等互斥锁。
///
/// 与 [`super::SpinMutex`] 不同，这是一把“裸”锁：它不保护数据，
/// 由调用方配对 `lock` / `unlock`。持有者可以任意次重复 `lock`，
/// 并以相同次数 `unlock`。
///
/// 由非持有线程调用 `unlock` 是调用方错误，调试构建会断言。
pub struct RecursiveMutex {
    /// 持有线程编号，0 表示未被持有
    owner: AtomicU64,
    /// 重入深度；只有持有线程读写（owner == 自己 时）
    depth: AtomicU32,
}

impl RecursiveMutex {
    /// 创建一个未锁定的 `RecursiveMutex`。
    pub const fn new() -> Self {
        RecursiveMutex {
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        }
    }

    /// 忙等直到获取锁；持有者重复调用只递增深度。
    pub fn lock(&self) {
        let me = current_thread_id();
        // 重入快路径：owner 只有可能被自己写成 me，Relaxed 读足够
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.depth.store(1, Ordering::Relaxed);
    }

    /// 尝试获取锁，立即返回是否成功。
    pub fn try_lock(&self) -> bool {
        let me = current_thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// 在 `timeout` 时限内尝试获取锁。
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.try_lock_until(Instant::now() + timeout)
    }

    /// 在截止时间之前尝试获取锁，每次自旋都检查时钟。
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        let me = current_thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if Instant::now() >= deadline {
                return false;
            }
            hint::spin_loop();
        }
        self.depth.store(1, Ordering::Relaxed);
        true
    }

    /// 释放一层锁；深度归零时真正放开。
    ///
    /// 必须由当前持有线程调用，否则行为未定义（调试构建断言）。
    pub fn unlock(&self) {
        debug_assert_eq!(
            self.owner.load(Ordering::Relaxed),
            current_thread_id(),
            "RecursiveMutex unlocked by non-owner"
        );
        debug_assert!(self.depth.load(Ordering::Relaxed) > 0);

        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecursiveMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveMutex")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as Counter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentrant_depth_counts() {
        let m = RecursiveMutex::new();
        m.lock();
        assert!(m.try_lock());
        assert!(m.try_lock_for(Duration::from_millis(1)));
        // 三层获取需要三次释放，期间其他线程不可进入
        m.unlock();
        m.unlock();
        m.unlock();
    }

    #[test]
    fn excludes_other_threads_until_fully_released() {
        let m = Arc::new(RecursiveMutex::new());
        let shared = Arc::new(Counter::new(0));

        m.lock();
        m.lock();

        let contender = {
            let m = Arc::clone(&m);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                m.lock();
                shared.store(1, Ordering::SeqCst);
                m.unlock();
            })
        };

        // 只释放一层，竞争线程仍然拿不到
        m.unlock();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(shared.load(Ordering::SeqCst), 0);

        m.unlock();
        contender.join().unwrap();
        assert_eq!(shared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_reentrancy_stress() {
        let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let m = Arc::new(RecursiveMutex::new());
        let value = Arc::new(Counter::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let m = Arc::clone(&m);
                let value = Arc::clone(&value);
                thread::spawn(move || {
                    for _ in 0..500 {
                        m.lock();
                        m.lock();
                        // 两层锁内的非原子读改写必须保持一致
                        let v = value.load(Ordering::Relaxed);
                        value.store(v + 1, Ordering::Relaxed);
                        m.unlock();
                        m.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(value.load(Ordering::SeqCst), threads as u64 * 500);
    }
}
