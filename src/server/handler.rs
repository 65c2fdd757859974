//! 每连接的 HTTP/1.1 处理器状态机。
//!
//! 状态流转：**reading → handling → writing**，失败或保活结束进入
//! **closing**。整个状态机是一个 `async fn`，被服务器 spawn 成独立任务
//! 运行——任务即 strand，套接字上的所有操作天然串行。
//!
//! - **reading**：带保活超时地读一条请求。干净 EOF → closing(`eof`)；
//!   超时 → closing(`timeout`)；解析失败 → 回 400 后 closing；
//! - **handling**：调用用户服务。服务出错时响应被替换为 500，
//!   body 是错误的描述文本；
//! - **writing**：不设超时地写回响应（节奏由对端控制），随后按
//!   保活判定回到 reading 或进入 closing(`finished`)；
//! - **closing**：优雅关闭套接字，按 verbose 级别报告整条连接的
//!   处理时长。

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, SERVER};
use http::{StatusCode, Version};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::proto::h1::{self, RawTarget};
use crate::service::Service;
use crate::{headers, Request, Response};

/// `Server` 响应头的固定值。
const SERVER_NAME: &str = "httpool";

/// 处理器配置，运行中不可更改。
///
/// 字段名按清单（manifest）里 `Details` 对象的约定命名。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandlerConfig {
    /// 每个会话的缓冲区大小（头部与 body 各自受此上限约束）
    pub buffer_limit: usize,
    /// 保活超时（秒），超时无活动的连接会被关闭
    pub keep_alive_timeout: u64,
    /// 保活次数限制，`None` 表示无限制
    pub keep_alive_max: Option<u32>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            buffer_limit: 8 << 10,
            keep_alive_timeout: 3,
            keep_alive_max: None,
        }
    }
}

/// 一条已接受连接上的处理器。
pub(crate) struct Handler<S> {
    service: Arc<S>,
    config: Arc<HandlerConfig>,
    stream: TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
    keep_alive_count: u32,
}

impl<S> Handler<S>
where
    S: Service<Request, Response = Response> + Send + Sync + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send,
{
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        service: Arc<S>,
        config: Arc<HandlerConfig>,
    ) -> Handler<S> {
        let buf = BytesMut::with_capacity(config.buffer_limit.min(8 << 10));
        Handler {
            service,
            config,
            stream,
            peer,
            buf,
            keep_alive_count: 0,
        }
    }

    /// 驱动状态机直到连接结束。
    pub(crate) async fn run(mut self) {
        debug!(peer = %self.peer, "start");
        let began = Instant::now();

        let reason = loop {
            // ---- reading ----
            let read_timeout = Duration::from_secs(self.config.keep_alive_timeout);
            let req = match timeout(
                read_timeout,
                h1::read_request(&mut self.stream, &mut self.buf, self.config.buffer_limit),
            )
            .await
            {
                Err(_elapsed) => {
                    debug!(peer = %self.peer, "read timeout");
                    break "timeout";
                }
                Ok(Ok(None)) => break "eof",
                Ok(Ok(Some(req))) => req,
                Ok(Err(e)) if e.is_parse() => {
                    // 协议错误：把解析错误文本作为 400 回给对端，然后关闭
                    let res = self.finish_response(bad_request(&e), false);
                    if let Err(e) = h1::write_response(&mut self.stream, &res).await {
                        warn!(peer = %self.peer, error = %e, "write failed");
                    }
                    break "bad request";
                }
                Ok(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "read failed");
                    break "error";
                }
            };

            // ---- handling ----
            let handle_began = Instant::now();
            let keep_alive_req = headers::wants_keep_alive(req.version(), req.headers());
            let method = req.method().clone();
            let target = req
                .extensions()
                .get::<RawTarget>()
                .map(|t| t.0.clone())
                .unwrap_or_else(|| req.uri().to_string());

            let (mut res, service_err) = match self.service.call(req).await {
                Ok(res) => (res, None),
                Err(e) => {
                    let e = e.into();
                    (internal_error(&*e), Some(e.to_string()))
                }
            };

            // 请求保活且仍在次数限制内，响应才声明保活
            let declare_keep_alive = keep_alive_req
                && self
                    .config
                    .keep_alive_max
                    .map_or(true, |max| self.keep_alive_count < max);
            res = self.finish_response(res, declare_keep_alive);

            match service_err {
                None => info!(
                    peer = %self.peer,
                    count = self.keep_alive_count,
                    status = res.status().as_u16(),
                    elapsed = ?handle_began.elapsed(),
                    "{} {}", method, target,
                ),
                Some(err) => info!(
                    peer = %self.peer,
                    count = self.keep_alive_count,
                    status = res.status().as_u16(),
                    elapsed = ?handle_began.elapsed(),
                    error = %err,
                    "{} {}", method, target,
                ),
            }

            // ---- writing ----（不设超时，节奏由对端控制）
            if let Err(e) = h1::write_response(&mut self.stream, &res).await {
                warn!(peer = %self.peer, error = %e, "write failed");
                break "error";
            }

            self.keep_alive_count += 1;
            let within_limit = self
                .config
                .keep_alive_max
                .map_or(true, |max| self.keep_alive_count < max);
            if !(declare_keep_alive && within_limit) {
                break "finished";
            }
        };

        // ---- closing ----
        if let Err(e) = self.stream.shutdown().await {
            info!(peer = %self.peer, error = %e, "shutdown failed");
        }
        debug!(peer = %self.peer, elapsed = ?began.elapsed(), "done: {}", reason);
    }

    /// on-handle 收尾：钉住版本、设置保活与 `Server` 头、重算
    /// `Content-Length`。
    fn finish_response(&self, mut res: Response, keep_alive: bool) -> Response {
        *res.version_mut() = Version::HTTP_11;

        if keep_alive {
            res.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            let value = match self.config.keep_alive_max {
                Some(max) => format!(
                    "timeout={}, max={}",
                    self.config.keep_alive_timeout, max
                ),
                None => format!("timeout={}", self.config.keep_alive_timeout),
            };
            res.headers_mut().insert(
                HeaderName::from_static("keep-alive"),
                HeaderValue::from_str(&value).expect("keep-alive value is ascii"),
            );
        } else {
            res.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        res.headers_mut()
            .insert(SERVER, HeaderValue::from_static(SERVER_NAME));
        let len = res.body().len() as u64;
        headers::set_content_length(res.headers_mut(), len);
        res
    }
}

fn text(status: StatusCode, body: Bytes) -> Response {
    let mut res = http::Response::new(body);
    *res.status_mut() = status;
    res
}

fn bad_request(err: &crate::Error) -> Response {
    text(StatusCode::BAD_REQUEST, Bytes::from(err.to_string()))
}

fn internal_error(err: &(dyn StdError + Send + Sync)) -> Response {
    text(StatusCode::INTERNAL_SERVER_ERROR, Bytes::from(err.to_string()))
}

impl<S> std::fmt::Debug for Handler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("peer", &self.peer)
            .field("keep_alive_count", &self.keep_alive_count)
            .finish()
    }
}
