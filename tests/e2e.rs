//! HTTP 端到端测试：真实套接字上的服务端 + 客户端组合。
//!
//! 每个测试用自己的执行器、绑定 127.0.0.1:0 取随机端口，互不干扰。

use std::time::Duration;

use bytes::Bytes;
use httpool::client::{Client, Config};
use httpool::header::{CONNECTION, CONTENT_TYPE, KEEP_ALIVE};
use httpool::rt::Executor;
use httpool::server::{HandlerConfig, Server};
use httpool::service::builtin::{HelloWorld, Matpowsum};
use httpool::{RawTarget, Request, StatusCode};

fn get(target: &str, authority: &str) -> Request {
    let mut req = Request::new(Bytes::new());
    req.extensions_mut().insert(RawTarget(target.to_string()));
    req.headers_mut()
        .insert(httpool::header::HOST, authority.parse().unwrap());
    req
}

/// 起一个服务器，返回 (server, 实际端口)。
fn start_server<S>(ex: &Executor, service: S, config: HandlerConfig) -> (Server<S>, u16)
where
    S: httpool::service::Service<Request, Response = httpool::Response> + Send + Sync + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send,
{
    let server = Server::new("test", service, config);
    server
        .start(ex, "127.0.0.1:0".parse().unwrap(), 128)
        .unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

fn client_for(ex: &Executor, port: u16) -> Client {
    Client::new(
        Config {
            host: "127.0.0.1".into(),
            port,
            ..Config::default()
        },
        ex,
    )
}

#[test]
fn hello_world_basic() {
    let ex = Executor::new(1);
    ex.start();
    let (server, port) = start_server(&ex, HelloWorld, HandlerConfig::default());
    let client = client_for(&ex, port);

    let res = client.http(get("/", &format!("127.0.0.1:{port}"))).unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.body().as_ref(), b"Hello, World!");
    assert_eq!(res.headers()[CONTENT_TYPE], "text/plain");

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn hello_world_async() {
    let ex = Executor::new(2);
    ex.start();
    let (server, port) = start_server(&ex, HelloWorld, HandlerConfig::default());
    let client = client_for(&ex, port);

    let res = ex
        .block_on(client.async_http(get("/", &format!("127.0.0.1:{port}"))))
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.body().as_ref(), b"Hello, World!");

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn matpowsum_well_formed() {
    let ex = Executor::new(1);
    ex.start();
    let (server, port) = start_server(&ex, Matpowsum, HandlerConfig::default());
    let client = client_for(&ex, port);

    let res = client
        .http(get("/?k=3&n=4", &format!("127.0.0.1:{port}")))
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = std::str::from_utf8(res.body()).unwrap();
    assert!(body.starts_with("matpowsum(k=3, n=4) = "), "body: {body}");
    let value: f64 = body.rsplit(' ').next().unwrap().parse().unwrap();
    assert!((value - 3.0).abs() < 1e-6);

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn matpowsum_missing_parameter() {
    let ex = Executor::new(1);
    ex.start();
    let (server, port) = start_server(&ex, Matpowsum, HandlerConfig::default());
    let client = client_for(&ex, port);

    let res = client
        .http(get("/?k=3", &format!("127.0.0.1:{port}")))
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(res.body().as_ref(), b"Missing parameter 'k' or 'n'");

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn matpowsum_malformed_uri() {
    let ex = Executor::new(1);
    ex.start();
    let (server, port) = start_server(&ex, Matpowsum, HandlerConfig::default());
    let client = client_for(&ex, port);

    // 畸形的 request-target 原样送达服务端
    let res = client.http(get(":::", &format!("127.0.0.1:{port}"))).unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(res.body().as_ref(), b"Invalid URI");

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn matpowsum_service_error_becomes_500() {
    let ex = Executor::new(1);
    ex.start();
    let (server, port) = start_server(&ex, Matpowsum, HandlerConfig::default());
    let client = client_for(&ex, port);

    // 参数不是数字：处理失败被转成 500，body 是错误文本
    let res = client
        .http(get("/?k=a&n=1", &format!("127.0.0.1:{port}")))
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!res.body().is_empty());

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn keep_alive_reuse_within_max() {
    let ex = Executor::new(2);
    ex.start();
    let (server, port) = start_server(
        &ex,
        HelloWorld,
        HandlerConfig {
            keep_alive_max: Some(3),
            ..HandlerConfig::default()
        },
    );
    let client = client_for(&ex, port);
    let authority = format!("127.0.0.1:{port}");

    // 第 1、2 条响应声明保活并入池；连接池始终不超过一条连接
    for i in 0..2 {
        let res = client.http(get("/", &authority)).unwrap();
        assert_eq!(res.status(), StatusCode::OK, "request {i}");
        assert_eq!(res.headers()[CONNECTION], "keep-alive");
        let ka = res.headers()[KEEP_ALIVE].to_str().unwrap();
        assert!(ka.contains("max=3"), "keep-alive: {ka}");
        assert_eq!(client.cached_connections(), 1);
    }

    // 第 3 条用完服务端的保活预算；客户端也不再缓存耗尽的连接
    let res = client.http(get("/", &authority)).unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(client.cached_connections(), 0);

    server.stop();
    ex.stop();
}

#[test]
fn keep_alive_expiry_drops_cached_connection() {
    let ex = Executor::new(2);
    ex.start();
    let (server, port) = start_server(
        &ex,
        HelloWorld,
        HandlerConfig {
            keep_alive_timeout: 1,
            ..HandlerConfig::default()
        },
    );
    let client = client_for(&ex, port);
    let authority = format!("127.0.0.1:{port}");

    let res = client.http(get("/", &authority)).unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(client.cached_connections(), 1);

    // 超过对端声明的 timeout=1 后，失效定时器把连接踢出池
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(client.cached_connections(), 0);

    // 再次请求走全新连接
    let res = client.http(get("/", &authority)).unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn retry_bridges_server_cold_start() {
    let ex = Executor::new(2);
    ex.start();

    // 先占一个端口再放掉，制造"服务器还没起来"的窗口
    let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let client = Client::new(
        Config {
            host: "127.0.0.1".into(),
            port,
            max_retry: 1,
            timeout: Duration::from_millis(500),
            ..Config::default()
        },
        &ex,
    );
    let authority = format!("127.0.0.1:{port}");

    // 服务器尚未启动：重试预算耗尽后干净地失败
    let err = client.http(get("/", &authority)).unwrap_err();
    assert!(err.is_retry_exhausted());

    // 服务器冷启动后，下一次发起的请求成功
    let server = Server::new("late", HelloWorld, HandlerConfig::default());
    server
        .start(&ex, format!("127.0.0.1:{port}").parse().unwrap(), 128)
        .unwrap();

    let mut last = None;
    for _ in 0..50 {
        match client.http(get("/", &authority)) {
            Ok(res) => {
                last = Some(res);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    let res = last.expect("request after server start should succeed");
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.body().as_ref(), b"Hello, World!");

    client.clear_connections();
    server.stop();
    ex.stop();
}

#[test]
fn concurrent_clients_share_pool() {
    let ex = Executor::new(4);
    ex.start();
    let (server, port) = start_server(&ex, HelloWorld, HandlerConfig::default());
    let client = std::sync::Arc::new(client_for(&ex, port));
    let authority = format!("127.0.0.1:{port}");

    // 多任务并发打同一个客户端：全部成功，池中只会留下少量连接
    let results = ex.block_on(async {
        let mut joins = Vec::new();
        for _ in 0..16 {
            let client = std::sync::Arc::clone(&client);
            let authority = authority.clone();
            joins.push(tokio::spawn(async move {
                client.async_http(get("/", &authority)).await
            }));
        }
        let mut statuses = Vec::new();
        for j in joins {
            statuses.push(j.await.unwrap().unwrap().status());
        }
        statuses
    });
    assert_eq!(results.len(), 16);
    assert!(results.iter().all(|s| *s == StatusCode::OK));
    assert!(client.cached_connections() <= 16);

    client.clear_connections();
    assert_eq!(client.cached_connections(), 0);
    server.stop();
    ex.stop();
}
