//! 服务工具函数：从闭包构造 [`Service`]。

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use crate::service::Service;
use crate::{Request, Response};

/// 从函数或闭包创建一个 [`Service`]。
///
/// # 示例
///
/// ```
/// use bytes::Bytes;
/// use httpool::service::service_fn;
/// use httpool::{Request, Response};
///
/// let service = service_fn(|_req: Request| async move {
///     Ok::<_, std::convert::Infallible>(Response::new(Bytes::from("Hello World")))
/// });
/// # let _ = service;
/// ```
pub fn service_fn<F, Ret>(f: F) -> ServiceFn<F>
where
    F: Fn(Request) -> Ret,
    Ret: Future,
{
    ServiceFn { f }
}

/// [`service_fn`] 返回的 Service 适配器。
pub struct ServiceFn<F> {
    f: F,
}

impl<F, Ret, E> Service<Request> for ServiceFn<F>
where
    F: Fn(Request) -> Ret,
    Ret: Future<Output = Result<Response, E>>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    type Response = Response;
    type Error = E;
    type Future = Ret;

    fn call(&self, req: Request) -> Self::Future {
        (self.f)(req)
    }
}

impl<F> fmt::Debug for ServiceFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 闭包没有 Debug，只输出类型描述
        f.debug_struct("impl Service").finish()
    }
}

impl<F: Clone> Clone for ServiceFn<F> {
    fn clone(&self) -> Self {
        ServiceFn { f: self.f.clone() }
    }
}

impl<F: Copy> Copy for ServiceFn<F> {}
