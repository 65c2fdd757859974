//! 客户端连接：池化载荷与失效定时器句柄。

use futures_util::future::AbortHandle;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::info;

/// 一条可复用的客户端连接，作为载荷存进连接池。
///
/// 入池时布防一个失效定时器（`expiry` 是它的取消句柄）；取出复用时
/// 先取消定时器。`remaining` 是对端 `Keep-Alive: max` 声明的剩余
/// 可用次数，耗尽的连接不再入池。
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) expiry: Option<AbortHandle>,
    pub(crate) remaining: Option<u64>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream) -> Connection {
        Connection {
            stream,
            expiry: None,
            remaining: None,
        }
    }

    /// 优雅关闭：半关写方向后交给析构收尾。
    ///
    /// 关闭中的错误只记日志不上报——套接字析构无论如何会完成关闭。
    pub(crate) async fn shutdown_gracefully(mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
        if let Err(e) = self.stream.shutdown().await {
            info!(error = %e, "shutdown failed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // 带着定时器被丢弃（池清空、到期淘汰）时顺手取消定时器，
        // 避免空转的计时任务攒在执行器里
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.stream.peer_addr().ok())
            .field("remaining", &self.remaining)
            .finish()
    }
}
