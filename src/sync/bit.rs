//! 位打包自旋锁。
//!
//! [`BitLock`] 征用标量 `T` 中的第 `B` 位作为锁位，其余位保留为载荷：
//! [`BitLock::masked`] 读取清掉锁位后的载荷，[`BitLock::set_masked`]
//! 原子地替换载荷且保持锁位不变。当一个小结构里本来就有一个对齐指针
//! 或空闲的高位时，这能省下整整一条缓存行——资源池节点用它把前驱
//! 地址和节点锁压进同一个机器字。

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

mod sealed {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for usize {}
}

/// 可以被 [`BitLock`] 打包的标量类型。
///
/// 为 `u32` / `u64` / `usize` 实现；指针载荷以 `usize` 地址形式打包
/// （对齐至少为 2 的指针低位恒为零，锁位取 0 即可）。
/// 这个 trait 是封闭的，不可在外部实现。
pub trait Packable: Copy + Eq + fmt::Debug + sealed::Sealed {
    /// 对应的原子类型。
    #[doc(hidden)]
    type Atomic;

    #[doc(hidden)]
    fn new_atomic(v: Self) -> Self::Atomic;
    #[doc(hidden)]
    fn load(a: &Self::Atomic, order: Ordering) -> Self;
    #[doc(hidden)]
    fn compare_exchange_weak(
        a: &Self::Atomic,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;
    #[doc(hidden)]
    fn compare_exchange(
        a: &Self::Atomic,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;
    #[doc(hidden)]
    fn fetch_and(a: &Self::Atomic, mask: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn bit(b: u32) -> Self;
    #[doc(hidden)]
    fn not(self) -> Self;
    #[doc(hidden)]
    fn and(self, other: Self) -> Self;
    #[doc(hidden)]
    fn or(self, other: Self) -> Self;
}

macro_rules! packable {
    ($t:ty, $atomic:ty) => {
        impl Packable for $t {
            type Atomic = $atomic;

            fn new_atomic(v: Self) -> Self::Atomic {
                <$atomic>::new(v)
            }
            fn load(a: &Self::Atomic, order: Ordering) -> Self {
                a.load(order)
            }
            fn compare_exchange_weak(
                a: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                a.compare_exchange_weak(current, new, success, failure)
            }
            fn compare_exchange(
                a: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                a.compare_exchange(current, new, success, failure)
            }
            fn fetch_and(a: &Self::Atomic, mask: Self, order: Ordering) -> Self {
                a.fetch_and(mask, order)
            }
            fn bit(b: u32) -> Self {
                1 << b
            }
            fn not(self) -> Self {
                !self
            }
            fn and(self, other: Self) -> Self {
                self & other
            }
            fn or(self, other: Self) -> Self {
                self | other
            }
        }
    };
}

packable!(u32, AtomicU32);
packable!(u64, AtomicU64);
packable!(usize, AtomicUsize);

/// 使用标量 `T` 的第 `B` 位作为自旋锁，其余位作为载荷。
///
/// - 获取：CAS 循环，`expected` 清锁位、`desired` 置锁位，acquire 语义；
/// - 释放：`fetch_and` 清锁位，release 语义；
/// - 载荷读写（[`masked`](Self::masked) / [`set_masked`](Self::set_masked)）
///   可以与锁操作并发，锁位始终保持。
///
/// # 示例
///
/// ```
/// use httpool::sync::BitLock;
///
/// // 第 10 位作锁，其余位是载荷
/// let lock: BitLock<u32, 10> = BitLock::new(3);
/// lock.lock();
/// assert_eq!(lock.masked(), 3);
/// lock.set_masked(5);
/// lock.unlock();
/// assert_eq!(lock.masked(), 5); // 载荷在加锁/解锁间往返保持
/// ```
pub struct BitLock<T: Packable, const B: u32> {
    value: T::Atomic,
}

impl<T: Packable, const B: u32> BitLock<T, B> {
    /// 用初始载荷创建锁；`value` 的第 `B` 位会被清除。
    pub fn new(value: T) -> Self {
        BitLock {
            value: T::new_atomic(value.and(T::bit(B).not())),
        }
    }

    /// 返回清掉锁位后的载荷。
    pub fn masked(&self) -> T {
        T::load(&self.value, Ordering::Acquire).and(T::bit(B).not())
    }

    /// 原子地用 `v` 的非锁位替换载荷，保持当前锁位。
    pub fn set_masked(&self, v: T) {
        let payload = v.and(T::bit(B).not());
        let mut current = T::load(&self.value, Ordering::Relaxed);
        loop {
            let desired = payload.or(current.and(T::bit(B)));
            match T::compare_exchange_weak(
                &self.value,
                current,
                desired,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 如果锁位已被置位，返回 `true`。
    pub fn is_locked(&self) -> bool {
        T::load(&self.value, Ordering::Relaxed).and(T::bit(B)) == T::bit(B)
    }

    /// 忙等直到获取锁位。
    pub fn lock(&self) {
        let mut expected = T::load(&self.value, Ordering::Relaxed).and(T::bit(B).not());
        loop {
            match T::compare_exchange_weak(
                &self.value,
                expected,
                expected.or(T::bit(B)),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    // 失败时以观察到的值（去锁位）作为下一轮期望
                    expected = actual.and(T::bit(B).not());
                    hint::spin_loop();
                }
            }
        }
    }

    /// 尝试获取锁位，立即返回是否成功。
    pub fn try_lock(&self) -> bool {
        let expected = T::load(&self.value, Ordering::Relaxed).and(T::bit(B).not());
        T::compare_exchange(
            &self.value,
            expected,
            expected.or(T::bit(B)),
            Ordering::Acquire,
            Ordering::Relaxed,
        )
        .is_ok()
    }

    /// 在 `timeout` 时限内尝试获取锁位。
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.try_lock_until(Instant::now() + timeout)
    }

    /// 在截止时间之前尝试获取锁位，每次自旋都检查时钟。
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        let mut expected = T::load(&self.value, Ordering::Relaxed).and(T::bit(B).not());
        loop {
            if Instant::now() >= deadline {
                return false;
            }
            match T::compare_exchange_weak(
                &self.value,
                expected,
                expected.or(T::bit(B)),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    expected = actual.and(T::bit(B).not());
                    hint::spin_loop();
                }
            }
        }
    }

    /// 清除锁位，release 语义。必须由当前持有者调用。
    pub fn unlock(&self) {
        let prev = T::fetch_and(&self.value, T::bit(B).not(), Ordering::Release);
        debug_assert!(
            prev.and(T::bit(B)) == T::bit(B),
            "BitLock unlocked while not held"
        );
    }
}

impl<T: Packable, const B: u32> fmt::Debug for BitLock<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitLock")
            .field("bit", &B)
            .field("masked", &self.masked())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn payload_survives_lock_round_trip() {
        let lock: BitLock<u64, 0> = BitLock::new(0xdead_bee0);
        assert_eq!(lock.masked(), 0xdead_bee0);
        assert!(!lock.is_locked());

        lock.lock();
        assert!(lock.is_locked());
        // 加锁状态下载荷不受锁位影响
        assert_eq!(lock.masked(), 0xdead_bee0);

        lock.set_masked(0x1234_5678);
        assert!(lock.is_locked());
        lock.unlock();
        assert_eq!(lock.masked(), 0x1234_5678);
    }

    #[test]
    fn new_clears_lock_bit() {
        let lock: BitLock<u32, 3> = BitLock::new(0b1111);
        // 第 3 位在构造时被清除
        assert_eq!(lock.masked(), 0b0111);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_respects_holder() {
        let lock: BitLock<usize, 0> = BitLock::new(8);
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        assert!(!lock.try_lock_for(Duration::from_millis(2)));
        lock.unlock();
        assert!(lock.try_lock_until(Instant::now() + Duration::from_millis(2)));
        lock.unlock();
    }

    /// 高位锁 + 并发互斥：载荷作为计数器被锁保护地递增。
    #[test]
    fn concurrent_counter_under_bit_10() {
        let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let lock: Arc<BitLock<u32, 10>> = Arc::new(BitLock::new(0));
        const PER_THREAD: u32 = 200; // 载荷位宽有限，保持在第 10 位以下

        let handles: Vec<_> = (0..threads.min(4))
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        lock.lock();
                        lock.set_masked(lock.masked() + 1);
                        lock.unlock();
                    }
                })
            })
            .collect();
        let n = handles.len() as u32;
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.masked(), n * PER_THREAD);
    }
}
