//! HTTP 协议实现模块（非公共），目前只有 HTTP/1.1 编解码器。

pub(crate) mod h1;
