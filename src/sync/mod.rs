//! 自旋互斥原语族
//!
//! 本模块提供四种忙等（busy-wait）互斥原语，供极短临界区使用：
//!
//! - [`SpinMutex`] —— 普通自旋锁，保护一份内部数据；
//! - [`RecursiveMutex`] —— 可重入自旋锁，按持有线程计数；
//! - [`SharedMutex`] —— 读写自旋锁，单计数器编码读者数与写者哨兵；
//! - [`BitLock`] —— 位打包自旋锁，征用一个标量字中的一位作为锁，
//!   其余位保留为可观察的载荷。
//!
//! ## 在 httpool 中的角色
//!
//! 资源池（[`crate::pool`]）的每个节点用 [`BitLock`] 把前驱指针和
//! 节点锁压进同一个机器字，是这一族原语的主要调用方。其余三种锁
//! 作为通用原语导出。
//!
//! ## 注意
//!
//! 这些锁从不挂起线程，只忙等。它们只适合保护几条指令的临界区；
//! 任何可能 `.await` 或阻塞的区段都不应持有它们。

mod bit;
mod recursive;
mod shared;
mod spin;

pub use bit::{BitLock, Packable};
pub use recursive::RecursiveMutex;
pub use shared::{SharedMutex, SharedReadGuard, SharedWriteGuard};
pub use spin::{SpinGuard, SpinMutex};
