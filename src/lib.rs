#![deny(missing_docs)]                  // 所有公共 API 必须有文档注释
#![deny(missing_debug_implementations)] // 所有公共类型必须实现 Debug trait
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # httpool
//!
//! 一个小型系统工具箱：异步 HTTP/1.1 服务端/客户端，外加它们脚下的
//! 两个并发原语。
//!
//! - [`sync`] —— 自旋互斥原语族：普通、递归、共享（读写），以及
//!   征用标量一位做锁、其余位保留为载荷的位打包锁；
//! - [`pool`] —— 无锁侵入式资源池：并发插入、任意位置移除、按动态
//!   类型取出、与修改并发的存活遍历；
//! - [`rt`] —— 显式生命周期的多线程执行器与 strand 模型；
//! - [`server`] / [`client`] —— 构建在上面三者之上的 HTTP/1.1
//!   服务端与客户端：服务端实现 Keep-Alive 处理循环，客户端的
//!   连接缓存就是 [`pool`]，带失效定时器与重试预算。
//!
//! ## 快速开始
//!
//! ```no_run
//! use bytes::Bytes;
//! use httpool::client::{Client, Config};
//! use httpool::rt::Executor;
//! use httpool::server::{HandlerConfig, Server};
//! use httpool::service::builtin::HelloWorld;
//!
//! let ex = Executor::new(2);
//! ex.start();
//!
//! let server = Server::new("hello", HelloWorld, HandlerConfig::default());
//! server.start(&ex, "127.0.0.1:8000".parse().unwrap(), 128).unwrap();
//!
//! let client = Client::new(
//!     Config { host: "127.0.0.1".into(), port: 8000, ..Config::default() },
//!     &ex,
//! );
//! let mut req = httpool::Request::new(Bytes::new());
//! req.headers_mut().insert("host", "127.0.0.1:8000".parse().unwrap());
//! assert_eq!(client.http(req).unwrap().body().as_ref(), b"Hello, World!");
//!
//! server.stop();
//! ex.wait();
//! ```
//!
//! ## 范围
//!
//! 只有 HTTP/1.1：没有 TLS、HTTP/2、流水线，body 是普通的字节向量。
//! 需要更完整协议栈的场景请使用专门的 HTTP 库。

// 从 http crate 重新导出核心类型，用户无需单独声明 http 依赖
#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode, Uri, Version};

/// 重新导出的 [`http::header`]，外加 `http` crate 未提供的 `Keep-Alive` 头常量。
pub mod header {
    pub use http::header::*;

    /// `Keep-Alive` 头部名称（`http` crate 未收录为标准头部）。
    pub const KEEP_ALIVE: http::header::HeaderName =
        http::header::HeaderName::from_static("keep-alive");
}

pub use crate::error::{Error, Result};
pub use crate::proto::h1::RawTarget;

/// 字节向量 body 的 HTTP 请求。
pub type Request = http::Request<bytes::Bytes>;

/// 字节向量 body 的 HTTP 响应。
pub type Response = http::Response<bytes::Bytes>;

mod error;
mod headers;
mod proto;

pub mod client;
pub mod pool;
pub mod rt;
pub mod server;
pub mod service;
pub mod sync;
