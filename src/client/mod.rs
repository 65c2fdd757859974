//! HTTP 客户端：TCP 连接复用。
//!
//! 状态机：**resolve → connect → write → read**，每一步都有独立的
//! 截止时间；到点时取消该步的异步操作，完成回调把取消当作普通失败
//! 处理。步骤的失败处置：
//!
//! - resolve 失败 → 记日志，放弃；
//! - connect / write 失败 → 丢弃连接，在重试预算内带着全新连接
//!   从头再来；
//! - read 失败 → 记日志，放弃——请求已经发出，服务端状态可能已经
//!   改变，重试会造成重复执行。
//!
//! 读成功后做保活处理：对端声明保活则把连接放回池里并布防失效
//! 定时器（[`crate::pool::Pool`] 就是连接缓存），否则优雅关闭。
//! 定时器到点而未被取消时，连接被直接从池里丢弃，不做优雅关闭——
//! 对端多半已经先关了。

mod conn;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::{AbortHandle, Abortable};
use futures_util::FutureExt;
use http::header::HeaderName;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::pool::Pool;
use crate::rt::{Executor, Spawner};
use crate::{headers, proto::h1, Error, Request, Response, Result};

use conn::Connection;

/// 客户端配置。
#[derive(Debug, Clone)]
pub struct Config {
    /// 目标服务器地址
    pub host: String,
    /// 目标服务器端口
    pub port: u16,
    /// 每个会话的缓冲区大小
    pub buffer_limit: usize,
    /// 单步超时限制，分别作用于 resolve、connect、write、read
    pub timeout: Duration,
    /// 请求重试次数，超出则视为失败
    pub max_retry: u32,
    /// 保活超时限制：对端未在 `Keep-Alive` 头里声明 `timeout` 时，
    /// 缓存连接按这个时长失效
    pub keep_alive_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: String::new(),
            port: 80,
            buffer_limit: 8 << 10,
            timeout: Duration::from_secs(3),
            max_retry: 1,
            keep_alive_timeout: Duration::from_secs(3),
        }
    }
}

/// HTTP 客户端。
///
/// 同一个客户端的所有调用共享一个连接池；`http` 与 `async_http`
/// 都是并发安全的，可以在多个线程/任务里同时调用。
///
/// # 示例
///
/// ```no_run
/// use httpool::client::{Client, Config};
/// use httpool::rt::Executor;
///
/// let ex = Executor::new(2);
/// ex.start();
///
/// let client = Client::new(
///     Config { host: "127.0.0.1".into(), port: 8000, ..Config::default() },
///     &ex,
/// );
/// let mut req = httpool::Request::new(bytes::Bytes::new());
/// req.headers_mut().insert("host", "127.0.0.1:8000".parse().unwrap());
/// let res = client.http(req).unwrap();
/// assert_eq!(res.status(), 200);
/// ```
#[derive(Debug)]
pub struct Client {
    config: Config,
    spawner: Spawner,
    pool: Pool,
}

impl Client {
    /// 创建客户端。执行器必须已经启动；失效定时器会投递到它上面。
    pub fn new(config: Config, ex: &Executor) -> Client {
        Client {
            config,
            spawner: ex.spawner(),
            pool: Pool::new(),
        }
    }

    /// 阻塞发送 HTTP 请求，返回响应。
    ///
    /// # Panics
    ///
    /// 不可在执行器的工作线程上调用（阻塞会扣住工作线程）。
    pub fn http(&self, req: Request) -> Result<Response> {
        self.spawner.handle().block_on(self.async_http(req))
    }

    /// 异步发送 HTTP 请求。
    pub async fn async_http(&self, req: Request) -> Result<Response> {
        let mut retry: u32 = 0;
        loop {
            // 先从池里找预热的连接；没有就解析并拨号
            let mut conn = match self.checkout() {
                Some(conn) => {
                    debug!(remaining = ?conn.remaining, "reusing pooled connection");
                    conn
                }
                None => {
                    let addrs = match self.resolve().await {
                        Ok(addrs) => addrs,
                        Err(e) => {
                            warn!(host = %self.config.host, error = %e, "resolve failed");
                            return Err(e);
                        }
                    };
                    match self.dial(&addrs).await {
                        Ok(stream) => Connection::new(stream),
                        Err(e) => {
                            if retry >= self.config.max_retry {
                                warn!(error = %e, "connect failed");
                                return Err(Error::new_retry_exhausted(e));
                            }
                            retry += 1;
                            info!(error = %e, retry, "connect failed, retrying");
                            continue;
                        }
                    }
                }
            };

            // write：复用连接写失败同样换全新连接重试
            match timeout(self.config.timeout, h1::write_request(&mut conn.stream, &req)).await {
                Ok(Ok(())) => {}
                outcome => {
                    let e = flatten(outcome);
                    drop(conn);
                    if retry >= self.config.max_retry {
                        warn!(error = %e, "write failed");
                        return Err(Error::new_retry_exhausted(e));
                    }
                    retry += 1;
                    info!(error = %e, retry, "write failed, retrying");
                    continue;
                }
            }

            // read：请求已经发出，不能再重试
            let mut buf = BytesMut::with_capacity(self.config.buffer_limit.min(8 << 10));
            let res = match timeout(
                self.config.timeout,
                h1::read_response(&mut conn.stream, &mut buf, self.config.buffer_limit),
            )
            .await
            {
                Ok(Ok(res)) => res,
                outcome => {
                    let e = flatten(outcome);
                    warn!(error = %e, "read failed");
                    return Err(e);
                }
            };

            self.keep_alive(conn, &res).await;
            return Ok(res);
        }
    }

    /// 清空连接池，取消所有失效定时器。
    pub fn clear_connections(&self) {
        while let Some(conn) = self.pool.take_as::<Connection>() {
            drop(conn); // Drop 顺带取消定时器
        }
    }

    /// 当前池中缓存的连接数。
    pub fn cached_connections(&self) -> usize {
        self.pool.count()
    }

    fn checkout(&self) -> Option<Connection> {
        let mut conn = self.pool.take_as::<Connection>()?;
        if let Some(expiry) = conn.expiry.take() {
            // 复用前解除失效定时器
            expiry.abort();
        }
        Some(*conn)
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let authority = (self.config.host.as_str(), self.config.port);
        let addrs = match timeout(self.config.timeout, lookup_host(authority)).await {
            Ok(Ok(addrs)) => addrs.collect::<Vec<_>>(),
            Ok(Err(e)) => return Err(Error::new_io(e)),
            Err(_elapsed) => return Err(Error::new_timeout()),
        };
        if addrs.is_empty() {
            return Err(Error::new_io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            )));
        }
        Ok(addrs)
    }

    async fn dial(&self, addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut last = None;
        for &addr in addrs {
            match timeout(self.config.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last = Some(Error::new_io(e)),
                Err(_elapsed) => last = Some(Error::new_timeout()),
            }
        }
        Err(last.expect("resolve guarantees at least one address"))
    }

    /// 读成功后的保活处理。
    async fn keep_alive(&self, mut conn: Connection, res: &Response) {
        let keep = headers::wants_keep_alive(res.version(), res.headers());
        let params = res
            .headers()
            .get(HeaderName::from_static("keep-alive"))
            .map(headers::keep_alive_params)
            .unwrap_or_default();

        // 次数预算：首次采用对端声明的 max，此后每轮递减
        let remaining = match (conn.remaining, params.max) {
            (Some(prev), _) => Some(prev.saturating_sub(1)),
            (None, Some(max)) => Some(max.saturating_sub(1)),
            (None, None) => None,
        };

        if !keep || remaining == Some(0) {
            conn.shutdown_gracefully().await;
            return;
        }
        conn.remaining = remaining;

        // 入池并布防失效定时器；头部未声明 timeout 时用本地配置
        let expiry = params
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.keep_alive_timeout);
        let (abort, registration) = AbortHandle::new_pair();
        conn.expiry = Some(abort);
        let node = self.pool.give(conn);

        self.spawner.spawn(
            Abortable::new(
                async move {
                    sleep(expiry).await;
                    // 到点未被取消：直接从池里丢弃，不做优雅关闭
                    Pool::unlink(&node);
                },
                registration,
            )
            .map(|_| ()),
        );
    }
}

/// 把 `timeout()` 的双层结果压平成一个 [`Error`]。
fn flatten<T>(outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>) -> Error {
    match outcome {
        Ok(Ok(_)) => unreachable!("flatten called on success"),
        Ok(Err(e)) => e,
        Err(_elapsed) => Error::new_timeout(),
    }
}
