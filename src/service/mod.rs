//! 异步服务抽象。
//!
//! [`Service`] 是从请求到响应的异步转换接口，是服务端处理循环的
//! 扩展点：服务器本身不关心业务语义，每读到一条请求就调用一次
//! `Service::call`，把返回的响应写回连接。
//!
//! `call` 接受 `&self` 而非 `&mut self`——同一个服务实例可以被多条
//! 连接并发调用；需要可变状态时在实现内部用同步原语共享。
//!
//! [`service_fn`] 把一个异步闭包适配成 `Service`，是最常用的入口；
//! [`builtin`] 提供两个内置服务。

mod util;

pub mod builtin;

pub use util::{service_fn, ServiceFn};

use std::future::Future;

/// 异步的请求 → 响应转换。
///
/// 返回错误意味着"处理失败"：服务端处理循环会把错误文本包装成
/// 500 响应发回对端，而不是中断连接。
pub trait Service<Request> {
    /// 服务返回的响应类型。
    type Response;

    /// 服务可能产生的错误类型。
    type Error;

    /// 异步响应的 future 类型。
    type Future: Future<Output = Result<Self::Response, Self::Error>>;

    /// 处理一条请求。
    fn call(&self, req: Request) -> Self::Future;
}

impl<Request, S: Service<Request> + ?Sized> Service<Request> for &'_ S {
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn call(&self, req: Request) -> Self::Future {
        (**self).call(req)
    }
}

impl<Request, S: Service<Request> + ?Sized> Service<Request> for Box<S> {
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn call(&self, req: Request) -> Self::Future {
        (**self).call(req)
    }
}

impl<Request, S: Service<Request> + ?Sized> Service<Request> for std::sync::Arc<S> {
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn call(&self, req: Request) -> Self::Future {
        (**self).call(req)
    }
}
