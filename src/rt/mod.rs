//! 异步运行时胶水：执行器与 strand 模型
//!
//! [`Executor`] 把一个多线程 tokio 运行时包装成显式生命周期的工作池：
//! `start()` 拉起 N 个工作线程（幂等），`stop()` 取消并合流（幂等），
//! `wait()` 释放工作生命周期令牌、等队列排空后合流。
//!
//! ## strand 模型
//!
//! 一个 *strand* 是保证串行执行的逻辑执行上下文：投递到同一 strand 的
//! 任意两个任务之间存在 happens-before 边，不同 strand 则可以在不同
//! 工作线程上并行。在这套实现里，strand 就是一个 tokio 任务：每个套接字
//! 被唯一的任务独占持有，该任务顺序地执行套接字上的所有读写与定时操作，
//! 串行性由所有权直接给出，无需额外同步。
//!
//! ## 工作线程中的 unwind
//!
//! 经 [`Executor::spawn`] 投递的任务若发生 panic，会被就地捕获并以
//! error 级别记录，工作线程继续排空队列；任务的返回值以 `None` 呈现给
//! 等待方。

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use futures_util::FutureExt;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// 多线程执行器：创建指定数量的工作线程并运行任务队列。
///
/// 所有方法都接受 `&self`，可在线程间共享（通常包在 `Arc` 里或作为
/// 全局资源）。`start` / `stop` / `wait` 幂等，重复调用返回 `false`。
///
/// # 示例
///
/// ```no_run
/// use httpool::rt::Executor;
///
/// let ex = Executor::new(4);
/// assert!(ex.start());
/// ex.spawn(async { /* ... */ });
/// ex.wait(); // 排空队列并停机
/// ```
pub struct Executor {
    threads: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    runtime: Option<Runtime>,
    tracker: TaskTracker,
}

impl Executor {
    /// 创建执行器，暂不启动工作线程。
    ///
    /// # Panics
    ///
    /// `threads` 为 0 时 panic。
    pub fn new(threads: usize) -> Executor {
        assert!(threads > 0, "executor needs at least one worker thread");
        Executor {
            threads,
            inner: Mutex::new(Inner {
                runtime: None,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// 启动执行器：创建工作线程，当前线程立刻返回。
    ///
    /// 返回 `true` 表示启动成功；若已启动则返回 `false`。
    pub fn start(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.runtime.is_some() {
            return false;
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(self.threads)
            .thread_name("httpool-worker")
            .enable_all()
            .build()
            .expect("failed to build worker runtime");
        inner.runtime = Some(runtime);
        // 上一轮 wait() 可能已经 close 过旧的 tracker，换新的
        inner.tracker = TaskTracker::new();

        info!(threads = self.threads, "executor started");
        true
    }

    /// 停止执行器：取消未完成的任务并等待工作线程退出。
    ///
    /// 返回 `true` 表示停止成功；若已停止则返回 `false`。
    pub fn stop(&self) -> bool {
        let runtime = {
            let mut inner = self.inner.lock().unwrap();
            match inner.runtime.take() {
                Some(rt) => rt,
                None => return false,
            }
        };
        // drop 运行时会停掉所有工作线程；任务在下一个挂起点被取消
        drop(runtime);
        info!("executor stopped");
        true
    }

    /// 释放工作生命周期令牌，阻塞等待所有已投递任务完成，然后停机。
    ///
    /// 返回 `true` 表示本次调用完成了停机；若已停止则返回 `false`。
    ///
    /// # Panics
    ///
    /// 不可在工作线程上调用（会自我等待）。
    pub fn wait(&self) -> bool {
        let (handle, tracker) = {
            let inner = self.inner.lock().unwrap();
            match inner.runtime.as_ref() {
                Some(rt) => (rt.handle().clone(), inner.tracker.clone()),
                None => return false,
            }
        };
        tracker.close();
        handle.block_on(tracker.wait());
        self.stop()
    }

    /// 把任务投递到工作池。
    ///
    /// 任务中的 panic 会被捕获并记录，以 `None` 作为 join 结果；
    /// 正常完成时结果为 `Some(value)`。
    ///
    /// # Panics
    ///
    /// 执行器尚未启动时 panic。
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawner().spawn(fut)
    }

    /// 取得一个可克隆、可带进任务内部的投递句柄。
    ///
    /// # Panics
    ///
    /// 执行器尚未启动时 panic。
    pub fn spawner(&self) -> Spawner {
        let inner = self.inner.lock().unwrap();
        let rt = inner
            .runtime
            .as_ref()
            .expect("executor not started; call start() first");
        Spawner {
            handle: rt.handle().clone(),
            tracker: inner.tracker.clone(),
        }
    }

    /// 取得底层运行时句柄，用于在任意线程上投递或阻塞等待。
    ///
    /// # Panics
    ///
    /// 执行器尚未启动时 panic。
    pub fn handle(&self) -> Handle {
        let inner = self.inner.lock().unwrap();
        inner
            .runtime
            .as_ref()
            .expect("executor not started; call start() first")
            .handle()
            .clone()
    }

    /// 在当前线程阻塞地驱动一个 future 至完成。
    ///
    /// # Panics
    ///
    /// 执行器尚未启动时，或在工作线程上调用时 panic。
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle().block_on(fut)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // 析构时若仍在运行则停止并阻塞合流
        self.stop();
    }
}

/// 执行器的投递句柄：廉价克隆，可以被任务带走，在任意线程上继续
/// 往同一个工作池与生命周期令牌上投递任务。
#[derive(Clone, Debug)]
pub struct Spawner {
    handle: Handle,
    tracker: TaskTracker,
}

impl Spawner {
    /// 把任务投递到工作池，panic 语义与 [`Executor::spawn`] 相同。
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind().map(|result| match result {
            Ok(value) => Some(value),
            Err(panic) => {
                // panic 载荷通常是 &str 或 String，尽力还原成文本
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(panic = %msg, "worker task panicked");
                None
            }
        });
        self.tracker.spawn_on(guarded, &self.handle)
    }

    /// 底层运行时句柄。
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self.inner.lock().map(|i| i.runtime.is_some()).unwrap_or(false);
        f.debug_struct("Executor")
            .field("threads", &self.threads)
            .field("running", &running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn start_stop_idempotent() {
        let ex = Executor::new(2);
        assert!(ex.start());
        assert!(!ex.start());
        assert!(ex.stop());
        assert!(!ex.stop());
        // 停止后可以再次启动
        assert!(ex.start());
        assert!(ex.stop());
    }

    #[test]
    fn wait_drains_spawned_tasks() {
        let ex = Executor::new(2);
        ex.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            ex.spawn(async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(ex.wait());
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn panicking_task_is_contained() {
        let ex = Executor::new(1);
        ex.start();

        let h1 = ex.spawn(async { panic!("boom") });
        let h2 = ex.spawn(async { 7u32 });
        let (r1, r2) = ex.block_on(async { (h1.await, h2.await) });
        // panic 被捕获为 None，后续任务不受影响
        assert_eq!(r1.unwrap(), None);
        assert_eq!(r2.unwrap(), Some(7));
        ex.stop();
    }
}
