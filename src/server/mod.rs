//! HTTP 服务端：监听端口并为每条连接创建处理器。
//!
//! [`Server`] 只负责接受循环与生命周期，不懂 HTTP 语义：每接受一条
//! 连接就构造一个绑定到全新任务（strand）的处理器，把业务交给泛型
//! 参数里的 [`Service`]。
//!
//! 生命周期：[`Server::start`] 依次 打开 acceptor → 设置地址复用 →
//! 绑定 → 监听，任何一步失败都同步返回错误、不继续；每次状态切换都
//! 有日志。[`Server::stop`] 通过关停信号与接受循环串行化，循环在
//! 当前一次 accept 完成或取消后退出。

mod builder;
mod handler;

pub use builder::{BuildServer, BuiltServer, ServerBuilder, ServerConfig, Servers, EXAMPLE_MANIFEST};
pub use handler::HandlerConfig;

use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::rt::Executor;
use crate::service::Service;
use crate::{Error, Request, Response, Result};

use handler::Handler;

/// HTTP 服务器。
///
/// `S` 是每条请求的处理服务；服务实例被所有连接共享。
///
/// # 示例
///
/// ```no_run
/// use httpool::rt::Executor;
/// use httpool::server::{HandlerConfig, Server};
/// use httpool::service::builtin::HelloWorld;
///
/// let ex = Executor::new(2);
/// ex.start();
/// let server = Server::new("hello", HelloWorld, HandlerConfig::default());
/// server.start(&ex, "127.0.0.1:8000".parse().unwrap(), 128).unwrap();
/// // ...
/// server.stop();
/// ```
pub struct Server<S> {
    name: String,
    service: Arc<S>,
    config: Arc<HandlerConfig>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl<S> Server<S>
where
    S: Service<Request, Response = Response> + Send + Sync + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send,
{
    /// 创建服务器。`name` 用于日志标识。
    pub fn new(name: impl Into<String>, service: S, config: HandlerConfig) -> Server<S> {
        Server {
            name: name.into(),
            service: Arc::new(service),
            config: Arc::new(config),
            running: Mutex::new(None),
        }
    }

    /// 启动服务：打开 acceptor、设置地址复用、绑定、监听，然后在
    /// 执行器上开启接受循环。任何一步失败都返回错误、服务不启动。
    ///
    /// `backlog` 是监听队列长度。
    pub fn start(&self, ex: &Executor, addr: SocketAddr, backlog: i32) -> Result<()> {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return Err(Error::new_user_config("server already started"));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| {
                info!(server = %self.name, error = %e, "open failed");
                Error::new_io(e)
            })?;
        socket.set_reuse_address(true).map_err(|e| {
            info!(server = %self.name, error = %e, "set_option failed");
            Error::new_io(e)
        })?;
        socket.bind(&addr.into()).map_err(|e| {
            info!(server = %self.name, error = %e, "bind failed");
            Error::new_io(e)
        })?;
        socket.listen(backlog).map_err(|e| {
            info!(server = %self.name, error = %e, "listen failed");
            Error::new_io(e)
        })?;
        socket.set_nonblocking(true).map_err(Error::new_io)?;

        let std_listener: std::net::TcpListener = socket.into();
        let handle = ex.handle();
        let listener = {
            // from_std 需要运行时上下文来注册 reactor
            let _enter = handle.enter();
            tokio::net::TcpListener::from_std(std_listener).map_err(Error::new_io)?
        };
        let local_addr = listener.local_addr().map_err(Error::new_io)?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        let service = Arc::clone(&self.service);
        let config = Arc::clone(&self.config);
        let spawner = ex.spawner();
        let loop_spawner = spawner.clone();

        spawner.spawn(async move {
            loop {
                tokio::select! {
                    // stop() 与接受循环在此串行化
                    _ = shutdown_rx.changed() => {
                        info!(server = %name, "stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(server = %name, peer = %peer, "accepted");
                            // 每条连接一个全新任务：后续 I/O 都在它上面串行
                            let handler = Handler::new(
                                stream,
                                peer,
                                Arc::clone(&service),
                                Arc::clone(&config),
                            );
                            loop_spawner.spawn(handler.run());
                        }
                        Err(e) => {
                            info!(server = %name, error = %e, "accept failed");
                            break;
                        }
                    },
                }
            }
        });

        info!(server = %self.name, addr = %local_addr, "started");
        *running = Some(Running {
            shutdown: shutdown_tx,
            local_addr,
        });
        Ok(())
    }

    /// 停止监听。对未启动的服务器是无操作。
    ///
    /// 已建立的连接不受影响，会继续处理至保活超时或对端关闭。
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap();
        if let Some(running) = running.take() {
            // 接受循环持有接收端；发送失败说明循环已经退出
            let _ = running.shutdown.send(true);
        }
    }

    /// 实际监听地址（绑定端口 0 时从这里拿到分配的端口）。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().unwrap().as_ref().map(|r| r.local_addr)
    }

    /// 日志标识。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 处理器配置。
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }
}

impl<S> Drop for Server<S> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                let _ = running.shutdown.send(true);
            }
        }
    }
}

impl<S> fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.running.lock().ok().and_then(|r| r.as_ref().map(|r| r.local_addr));
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("addr", &addr)
            .finish()
    }
}
