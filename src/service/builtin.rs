//! 内置服务。
//!
//! - [`HelloWorld`]：无论什么请求都响应包含 `Hello, World!` 的 200 报文；
//! - [`Matpowsum`]：矩阵幂求和的演示服务，从查询参数取 `k` 与 `n`，
//!   计算 k×k 的全 1/k 矩阵 n 次幂的各项之和（数学上恰等于 k），
//!   以文本返回。主要用来制造可验证的 CPU 负载。

use std::convert::Infallible;
use std::error::Error as StdError;
use std::future::{ready, Ready};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{StatusCode, Uri};

use crate::proto::h1::RawTarget;
use crate::service::Service;
use crate::{Request, Response};

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response {
    let mut res = http::Response::new(body.into());
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    res
}

/// Hello World 服务。
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloWorld;

impl Service<Request> for HelloWorld {
    type Response = Response;
    type Error = Infallible;
    type Future = Ready<Result<Response, Infallible>>;

    fn call(&self, _req: Request) -> Self::Future {
        ready(Ok(text_response(
            StatusCode::OK,
            Bytes::from_static(b"Hello, World!"),
        )))
    }
}

/// 矩阵幂求和服务。
///
/// `GET /?k=3&n=4` → `matpowsum(k=3, n=4) = 3.000000`。
/// target 无法解析为 URI 时响应 400 `Invalid URI`；
/// `k` 或 `n` 缺失时响应 400 `Missing parameter 'k' or 'n'`；
/// 参数不是数字属于处理失败，由外层转成 500。
#[derive(Debug, Clone, Copy, Default)]
pub struct Matpowsum;

impl Service<Request> for Matpowsum {
    type Response = Response;
    type Error = Box<dyn StdError + Send + Sync>;
    type Future = Ready<Result<Response, Self::Error>>;

    fn call(&self, req: Request) -> Self::Future {
        ready(self.handle(&req))
    }
}

impl Matpowsum {
    fn handle(&self, req: &Request) -> Result<Response, Box<dyn StdError + Send + Sync>> {
        // 用原始 target 判断合法性，Uri 表示不了的畸形请求行在这里拒绝
        let target = req
            .extensions()
            .get::<RawTarget>()
            .map(|t| t.0.clone())
            .unwrap_or_else(|| req.uri().to_string());
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(_) => {
                return Ok(text_response(StatusCode::BAD_REQUEST, Bytes::from_static(b"Invalid URI")));
            }
        };

        let (mut k, mut n) = (None, None);
        for pair in uri.query().unwrap_or("").split('&') {
            match pair.split_once('=') {
                Some(("k", v)) => k = Some(v.to_string()),
                Some(("n", v)) => n = Some(v.to_string()),
                _ => {}
            }
        }
        let (Some(k), Some(n)) = (k, n) else {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                Bytes::from_static(b"Missing parameter 'k' or 'n'"),
            ));
        };

        let k: u32 = k.parse()?;
        let n: u32 = n.parse()?;
        let ans = matpowsum(k, n);
        Ok(text_response(
            StatusCode::OK,
            format!("matpowsum(k={}, n={}) = {:.6}", k, n, ans),
        ))
    }
}

/// 方阵，按行主序平铺存储。
struct Mat {
    rank: usize,
    data: Vec<f64>,
}

impl Mat {
    fn new(rank: usize) -> Mat {
        Mat {
            rank,
            data: vec![0.0; rank * rank],
        }
    }

    fn filled(rank: usize, v: f64) -> Mat {
        Mat {
            rank,
            data: vec![v; rank * rank],
        }
    }

    fn identity(rank: usize) -> Mat {
        let mut m = Mat::new(rank);
        for i in 0..rank {
            m.data[i * rank + i] = 1.0;
        }
        m
    }

    fn mul(&self, other: &Mat) -> Mat {
        debug_assert_eq!(self.rank, other.rank);
        let rank = self.rank;
        let mut ret = Mat::new(rank);
        for i in 0..rank {
            for j in 0..rank {
                let mut acc = 0.0;
                for k in 0..rank {
                    acc += self.data[i * rank + k] * other.data[k * rank + j];
                }
                ret.data[i * rank + j] = acc;
            }
        }
        ret
    }

    fn pow(&self, n: u32) -> Mat {
        let mut ret = Mat::identity(self.rank);
        for _ in 0..n {
            ret = ret.mul(self);
        }
        ret
    }

    fn sum(&self) -> f64 {
        self.data.iter().sum()
    }
}

fn matpowsum(k: u32, n: u32) -> f64 {
    let rank = k as usize;
    Mat::filled(rank, 1.0 / k as f64).pow(n).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(target: &str) -> Request {
        let mut req = http::Request::new(Bytes::new());
        if let Ok(uri) = target.parse::<Uri>() {
            *req.uri_mut() = uri;
        }
        req.extensions_mut().insert(RawTarget(target.to_string()));
        req
    }

    fn call_now<S: Service<Request, Future = Ready<Result<Response, E>>>, E>(
        svc: &S,
        req: Request,
    ) -> Result<Response, E> {
        futures_util::FutureExt::now_or_never(svc.call(req)).unwrap()
    }

    #[test]
    fn hello_world_always_200() {
        let res = call_now(&HelloWorld, get("/anything")).unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"Hello, World!");
        assert_eq!(res.headers()[CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn matpowsum_well_formed() {
        let res = call_now(&Matpowsum, get("/?k=3&n=4")).unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = std::str::from_utf8(res.body()).unwrap();
        assert!(body.starts_with("matpowsum(k=3, n=4) = "), "body: {body}");
        let value: f64 = body.rsplit(' ').next().unwrap().parse().unwrap();
        assert!((value - 3.0).abs() < 1e-6);
    }

    #[test]
    fn matpowsum_missing_parameter() {
        let res = call_now(&Matpowsum, get("/?k=3")).unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body().as_ref(), b"Missing parameter 'k' or 'n'");
    }

    #[test]
    fn matpowsum_invalid_uri() {
        let res = call_now(&Matpowsum, get(":::")).unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body().as_ref(), b"Invalid URI");
    }

    #[test]
    fn matpowsum_non_numeric_parameter_fails() {
        assert!(call_now(&Matpowsum, get("/?k=a&n=1")).is_err());
    }

    #[test]
    fn matpow_converges_to_rank() {
        // 幂等的平均矩阵：任意次幂之后各项和都等于 k
        for k in 1..5u32 {
            for n in 1..4u32 {
                assert!((matpowsum(k, n) - k as f64).abs() < 1e-9);
            }
        }
    }
}
