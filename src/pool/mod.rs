//! 无锁侵入式资源池
//!
//! 一个多生产者/多消费者的资源池，支持并发插入、从任意位置移除、
//! 按动态类型选择性取出，以及与修改并发的存活遍历：
//!
//! 1. 允许多个线程并发地插入资源；
//! 2. 允许多个线程并发地取出任一资源，无论资源由哪个线程插入；
//! 3. 允许遍历所有资源对象，但不保证遍历时的一致性——例如遍历到
//!    最后一个资源时，第一个资源可能已经被取走了。
//!
//! ## 数据结构
//!
//! 节点组成一条侵入式双向链表。前向边 `next` 是**拥有**引用
//! （`Arc`，前驱拥有后继）；后向边 `prev` 是裸地址，打包在一个
//! [`BitLock`] 里，其最低位就是该节点的自旋锁。桩（stub）是一个
//! 无载荷的哨兵节点，作为稳定的链表头锚点，从不交给调用者；
//! 池本身可克隆共享，桩与最后一个池句柄一同销毁。
//!
//! ## 加锁纪律
//!
//! 多节点加锁一律按前向顺序 `prev → here → next` 进行。[`Pool::unlink`]
//! 从 `here` 出发却要先锁前驱，因此采用重试协议：锁 `here` 读出前驱
//! 地址并升级成强引用，放开 `here` 再锁前驱，若前驱的 `next` 已不指向
//! `here` 则重试。该升级之所以安全，是因为把前驱摘出链表必须修改
//! `here.prev`，而这需要 `here` 的锁——升级发生时锁正在我们手里，
//! 前驱在拿到强引用之前不可能被释放。
//!
//! ## 不变式
//!
//! - `x.next == y` ⇒ `y.prev == x`（在任何修改完成后的有界步数内成立）；
//! - `x.prev == 0` ⇔ `x` 是桩，或 `x` 不在任何池中；
//! - 前向拥有链无环；
//! - 持有节点自旋位 ⇒ 该节点自身的 `next`、`prev` 与载荷只能由持有者改动。
//!
//! # 示例
//!
//! ```
//! use httpool::pool::Pool;
//!
//! let pool = Pool::new();
//! pool.give(42u32);
//! pool.give("conn");
//!
//! // 按动态类型取出
//! let n: Box<u32> = pool.take_as::<u32>().unwrap();
//! assert_eq!(*n, 42);
//! assert_eq!(pool.count(), 1);
//! ```

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use crate::sync::BitLock;

/// 池节点。
///
/// 资源节点与桩共享同一具体类型，靠有无载荷区分；对外不透明，
/// 仅作为 [`Pool::give`] 返回的句柄出现（用于之后的 [`Pool::unlink`]）。
pub struct Node {
    /// 前向拥有边，由本节点的自旋位保护
    next: UnsafeCell<Option<Arc<Node>>>,
    /// 前驱地址（usize），最低位是本节点的自旋锁
    prev: BitLock<usize, 0>,
    /// 资源载荷；桩为 `None`。由本节点的自旋位（或分离后的独占性）保护
    entry: UnsafeCell<Option<Box<dyn Any + Send>>>,
}

// SAFETY: next 与 entry 的访问都被节点自旋位（或节点分离后的独占性）
// 串行化；生命周期由 Arc 管理。
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    fn with_entry(entry: Option<Box<dyn Any + Send>>) -> Arc<Node> {
        Arc::new(Node {
            next: UnsafeCell::new(None),
            prev: BitLock::new(0),
            entry: UnsafeCell::new(entry),
        })
    }

    fn addr(&self) -> usize {
        self as *const Node as usize
    }

    /// 访问 next 槽。调用者必须持有本节点的自旋位，或保证节点未被共享。
    #[allow(clippy::mut_from_ref)]
    unsafe fn next_slot(&self) -> &mut Option<Arc<Node>> {
        &mut *self.next.get()
    }

    /// 访问载荷槽。调用者同上。
    #[allow(clippy::mut_from_ref)]
    unsafe fn entry_slot(&self) -> &mut Option<Box<dyn Any + Send>> {
        &mut *self.entry.get()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr())
            .field("pooled", &(self.prev.masked() != 0))
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // 迭代而非递归地放掉前向链，长链不会炸栈。
        // Arc::into_inner 只在自己是最后一个持有者时成功，
        // 否则剩余的链交给其他持有者。
        let mut next = self.next.get_mut().take();
        while let Some(node) = next {
            match Arc::into_inner(node) {
                Some(mut inner) => next = inner.next.get_mut().take(),
                None => break,
            }
        }
    }
}

/// 从池中取出、已与链表分离的节点。
///
/// 持有期间载荷仍在节点内，通过 [`Taken::downcast`] 按类型提取。
pub struct Taken {
    node: Arc<Node>,
}

impl Taken {
    /// 检查载荷的动态类型是否为 `T`。
    pub fn is<T: Any>(&self) -> bool {
        self.node.prev.lock();
        // SAFETY: 持有自旋位
        let matched = unsafe { self.node.entry_slot() }
            .as_ref()
            .is_some_and(|e| e.is::<T>());
        self.node.prev.unlock();
        matched
    }

    /// 按类型提取载荷；类型不符时原样退还。
    pub fn downcast<T: Any + Send>(self) -> Result<Box<T>, Taken> {
        if !self.is::<T>() {
            return Err(self);
        }
        self.node.prev.lock();
        // SAFETY: 持有自旋位；类型刚刚验证过
        let entry = unsafe { self.node.entry_slot() }.take();
        self.node.prev.unlock();
        Ok(entry.expect("entry verified present").downcast::<T>().unwrap())
    }
}

impl fmt::Debug for Taken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Taken").field("node", &*self.node).finish()
    }
}

/// 遍历/取出用的链上锚点：起点是借来的桩，之后是拥有的 Arc。
enum Anchor<'a> {
    Borrowed(&'a Node),
    Owned(Arc<Node>),
}

impl Anchor<'_> {
    fn node(&self) -> &Node {
        match self {
            Anchor::Borrowed(n) => n,
            Anchor::Owned(n) => n,
        }
    }
}

/// 线程安全的资源池。克隆共享同一条链。
#[derive(Clone)]
pub struct Pool {
    stub: Arc<Node>,
}

impl Pool {
    /// 创建一个空池。
    pub fn new() -> Pool {
        Pool {
            stub: Node::with_entry(None),
        }
    }

    /// 检查节点是否仍在某个池中。
    pub fn contains(node: &Node) -> bool {
        node.prev.masked() != 0
    }

    /// 把资源插入池头（桩之后），返回节点句柄，可用于之后的
    /// [`Pool::unlink`]。
    pub fn give<T: Any + Send>(&self, value: T) -> Arc<Node> {
        Self::give_after(&self.stub, value)
    }

    /// 把资源插入到 `after` 之后。`after` 必须是桩或在池中的节点。
    pub fn give_after<T: Any + Send>(after: &Node, value: T) -> Arc<Node> {
        let node = Node::with_entry(Some(Box::new(value)));
        let here = &*node;

        // 新节点尚不可达，这把锁必然立即成功；拿着它是为了让
        // 并发的 unlink/take 在链接完成前无法碰 here 的边。
        here.prev.lock();
        after.prev.lock();
        // SAFETY: 持有 after 的自旋位
        let next = unsafe { after.next_slot() }.clone();
        match next {
            None => {
                // SAFETY: 持有 after 的自旋位
                unsafe { *after.next_slot() = Some(node.clone()) };
                after.prev.unlock(); // 尽早放锁
                here.prev.set_masked(after.addr());
                here.prev.unlock();
            }
            Some(next) => {
                next.prev.lock();
                // SAFETY: 持有三把锁，按前向顺序取得
                let moved = unsafe { after.next_slot() }.replace(node.clone());
                after.prev.unlock(); // 尽早放锁
                here.prev.set_masked(after.addr());
                unsafe { *here.next_slot() = moved };
                next.prev.set_masked(here.addr());
                here.prev.unlock();
                next.prev.unlock();
            }
        }
        node
    }

    /// 取出桩之后的第一个资源；池空时返回 `None`。
    ///
    /// 返回的节点已与链表分离（`next`、`prev` 均已清空）。
    pub fn take(&self) -> Option<Taken> {
        Self::take_after(&self.stub)
    }

    /// 取出 `after` 之后的第一个资源。
    pub fn take_after(after: &Node) -> Option<Taken> {
        after.prev.lock();
        // SAFETY: 持有 after 的自旋位
        let here = match unsafe { after.next_slot() }.clone() {
            Some(here) => here,
            None => {
                after.prev.unlock();
                return None;
            }
        };

        here.prev.lock();
        // SAFETY: 持有 here 的自旋位
        let next = unsafe { here.next_slot() }.take();
        match next {
            None => {
                // SAFETY: 持有 after 的自旋位
                unsafe { *after.next_slot() = None };
                after.prev.unlock(); // 尽早放锁
                here.prev.set_masked(0);
                here.prev.unlock();
            }
            Some(next) => {
                next.prev.lock();
                // SAFETY: 持有三把锁
                unsafe { *after.next_slot() = Some(next.clone()) };
                after.prev.unlock(); // 尽早放锁
                next.prev.set_masked(after.addr());
                next.prev.unlock(); // 尽早放锁
                here.prev.set_masked(0);
                here.prev.unlock();
            }
        }
        Some(Taken { node: here })
    }

    /// 沿链前行，跳过动态类型不为 `T` 的节点，取出并返回第一个匹配者。
    pub fn take_as<T: Any + Send>(&self) -> Option<Box<T>> {
        Self::take_after_as(&self.stub)
    }

    /// 从 `after` 之后开始按类型取出。
    pub fn take_after_as<T: Any + Send>(after: &Node) -> Option<Box<T>> {
        after.prev.lock();
        let mut pred = Anchor::Borrowed(after);
        loop {
            // SAFETY: 持有 pred 的自旋位
            let here = match unsafe { pred.node().next_slot() }.clone() {
                Some(here) => here,
                None => {
                    pred.node().prev.unlock();
                    return None;
                }
            };
            here.prev.lock();
            // SAFETY: 持有 here 的自旋位
            let matched = unsafe { here.entry_slot() }
                .as_ref()
                .is_some_and(|e| e.is::<T>());
            if !matched {
                // 继续前行：先锁住 here（已持有），再放开 pred
                pred.node().prev.unlock();
                pred = Anchor::Owned(here);
                continue;
            }

            // 此刻持有 pred 与 here，按前向顺序补上 next 的锁后摘除
            // SAFETY: 持有 here 的自旋位
            let entry = unsafe { here.entry_slot() }.take();
            let next = unsafe { here.next_slot() }.take();
            match next {
                None => {
                    // SAFETY: 持有 pred 的自旋位
                    let owned = unsafe { pred.node().next_slot() }.take();
                    pred.node().prev.unlock();
                    here.prev.set_masked(0);
                    here.prev.unlock();
                    drop(owned);
                }
                Some(next) => {
                    next.prev.lock();
                    // SAFETY: 持有三把锁
                    let owned = unsafe { pred.node().next_slot() }.replace(next.clone());
                    pred.node().prev.unlock();
                    next.prev.set_masked(pred.node().addr());
                    next.prev.unlock();
                    here.prev.set_masked(0);
                    here.prev.unlock();
                    drop(owned);
                }
            }
            return Some(entry.expect("matched entry present").downcast::<T>().unwrap());
        }
    }

    /// 把节点从它所在的池中摘除。对已摘除的节点调用是无操作，
    /// 返回 `false`。
    pub fn unlink(node: &Arc<Node>) -> bool {
        let here = &**node;
        loop {
            here.prev.lock();
            let prev_addr = here.prev.masked();
            if prev_addr == 0 {
                // 不在任何池中
                here.prev.unlock();
                return false;
            }
            // SAFETY: 摘除前驱必须改写 here.prev，而那需要 here 的锁，
            // 锁此刻在我们手里，因此前驱此刻必然存活，可以安全升级。
            let prev: Arc<Node> = unsafe {
                let ptr = prev_addr as *const Node;
                Arc::increment_strong_count(ptr);
                Arc::from_raw(ptr)
            };
            // 先放开 here，等前驱锁定后再重新锁定，避免逆向加锁死锁
            here.prev.unlock();

            prev.prev.lock();
            // SAFETY: 持有 prev 的自旋位
            let still_linked = unsafe { prev.next_slot() }
                .as_ref()
                .map(|n| n.addr() == here.addr())
                .unwrap_or(false);
            if !still_linked {
                prev.prev.unlock();
                continue; // 链在放锁间隙里变了，重试
            }
            here.prev.lock();

            // SAFETY: 持有 prev 与 here
            let next = unsafe { here.next_slot() }.take();
            match next {
                None => {
                    let owned = unsafe { prev.next_slot() }.take();
                    prev.prev.unlock(); // 尽早放锁
                    here.prev.set_masked(0);
                    here.prev.unlock();
                    drop(owned);
                }
                Some(next) => {
                    next.prev.lock();
                    let owned = unsafe { prev.next_slot() }.replace(next.clone());
                    prev.prev.unlock(); // 尽早放锁
                    next.prev.set_masked(prev.addr());
                    next.prev.unlock(); // 尽早放锁
                    here.prev.set_masked(0);
                    here.prev.unlock();
                    drop(owned);
                }
            }
            return true;
        }
    }

    /// 丢弃桩之后的所有资源。
    pub fn clear(&self) {
        Self::clear_after(&self.stub);
    }

    /// 丢弃 `after` 之后的所有资源。
    pub fn clear_after(after: &Node) {
        while Self::take_after(after).is_some() {}
    }

    /// 统计池中的资源数。逐个节点取锁，O(n) 且与修改串行化。
    pub fn count(&self) -> usize {
        Self::count_after(&self.stub)
    }

    /// 统计 `after` 之后的资源数。
    pub fn count_after(after: &Node) -> usize {
        let mut n = 0;
        Self::for_each_after(after, |_| {
            n += 1;
            true
        });
        n
    }

    /// 从桩开始遍历资源载荷。访问期间持有该节点的自旋位；
    /// 闭包返回 `false` 时提前结束。
    ///
    /// 并发修改可能增删尚未到达的节点，遍历不保证快照语义。
    pub fn for_each<F: FnMut(&dyn Any) -> bool>(&self, f: F) {
        Self::for_each_after(&self.stub, f)
    }

    /// 从 `after` 之后开始遍历。
    pub fn for_each_after<F: FnMut(&dyn Any) -> bool>(after: &Node, mut f: F) {
        after.prev.lock();
        let mut cur = Anchor::Borrowed(after);
        loop {
            // SAFETY: 持有 cur 的自旋位
            let next = match unsafe { cur.node().next_slot() }.clone() {
                Some(next) => next,
                None => {
                    cur.node().prev.unlock();
                    return;
                }
            };
            // 先锁住下一个节点，再放开当前的，链不会从手里断开
            next.prev.lock();
            cur.node().prev.unlock();

            // SAFETY: 持有 next 的自旋位
            let keep = match unsafe { next.entry_slot() }.as_ref() {
                Some(entry) => f(&**entry),
                None => true, // 桩或已被掏空的节点，跳过
            };
            if !keep {
                next.prev.unlock();
                return;
            }
            cur = Anchor::Owned(next);
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("stub", &*self.stub).finish()
    }
}
