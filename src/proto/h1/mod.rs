//! HTTP/1.1 编解码器。
//!
//! 在任意 `AsyncRead` / `AsyncWrite` 上读写一条完整的 HTTP/1.1 消息：
//! 头部用 `httparse` 解析，body 按 `Content-Length` 定界（分块传输
//! 不在范围内），序列化直接格式化进 `BytesMut`。
//!
//! 调用方负责在保活周期间复用同一个读缓冲：一次读取多出来的字节会
//! 留在缓冲里，作为下一条消息的开头。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Parse;
use crate::{Error, Request, Response, Result};

/// 单条消息允许的最大头部字段数。
const MAX_HEADERS: usize = 100;

/// 请求行里的原始 request-target。
///
/// 编解码器总是把它塞进请求的 extensions：`http::Uri` 无法表示所有
/// 畸形 target，而服务（如需要报告 `Invalid URI` 的那些）要看到
/// 原始字节。target 无法解析为 `Uri` 时，请求的 `uri()` 退化为 `/`。
#[derive(Debug, Clone)]
pub struct RawTarget(pub String);

/// 读取一条完整的 HTTP/1.1 请求。
///
/// 干净的 EOF（缓冲为空时对端关闭）返回 `Ok(None)`；头部或 body 超过
/// `limit` 字节、解析失败、消息中途断流都返回错误。
pub(crate) async fn read_request<R>(
    io: &mut R,
    buf: &mut BytesMut,
    limit: usize,
) -> Result<Option<Request>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut headers);
            match parsed.parse(&buf[..]).map_err(Parse::from)? {
                httparse::Status::Complete(head_len) => {
                    let method =
                        Method::from_bytes(parsed.method.expect("complete request has method").as_bytes())
                            .map_err(Parse::from)?;
                    let version = version_from_minor(parsed.version.expect("complete request has version"))?;
                    let target = parsed.path.expect("complete request has path").to_string();
                    let headers = header_map(parsed.headers)?;

                    let mut req = http::Request::new(Bytes::new());
                    *req.method_mut() = method;
                    *req.version_mut() = version;
                    // 畸形 target 不在这里拒绝，留给服务按语义处理
                    if let Ok(uri) = Uri::try_from(target.as_str()) {
                        *req.uri_mut() = uri;
                    }
                    req.extensions_mut().insert(RawTarget(target));
                    *req.headers_mut() = headers;

                    buf.advance(head_len);
                    *req.body_mut() = read_body(io, buf, req.headers(), limit).await?;
                    return Ok(Some(req));
                }
                httparse::Status::Partial => {
                    if buf.len() > limit {
                        return Err(Error::new_too_large());
                    }
                }
            }
        }

        let n = io.read_buf(buf).await.map_err(Error::new_io)?;
        if n == 0 {
            return if buf.is_empty() {
                // 对端在消息边界处关闭
                Ok(None)
            } else {
                Err(Error::new_incomplete())
            };
        }
    }
}

/// 读取一条完整的 HTTP/1.1 响应。
pub(crate) async fn read_response<R>(io: &mut R, buf: &mut BytesMut, limit: usize) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut headers);
            match parsed.parse(&buf[..]).map_err(Parse::from)? {
                httparse::Status::Complete(head_len) => {
                    let status =
                        StatusCode::from_u16(parsed.code.expect("complete response has status"))
                            .map_err(Parse::from)?;
                    let version = version_from_minor(parsed.version.expect("complete response has version"))?;
                    let headers = header_map(parsed.headers)?;

                    let mut res = http::Response::new(Bytes::new());
                    *res.status_mut() = status;
                    *res.version_mut() = version;
                    *res.headers_mut() = headers;

                    buf.advance(head_len);
                    *res.body_mut() = read_body(io, buf, res.headers(), limit).await?;
                    return Ok(res);
                }
                httparse::Status::Partial => {
                    if buf.len() > limit {
                        return Err(Error::new_too_large());
                    }
                }
            }
        }

        let n = io.read_buf(buf).await.map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_incomplete());
        }
    }
}

/// 按 `Content-Length` 读完 body；多读的字节留在 `buf` 里。
async fn read_body<R>(
    io: &mut R,
    buf: &mut BytesMut,
    headers: &HeaderMap,
    limit: usize,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = match crate::headers::content_length_parse(headers) {
        Ok(len) => len.unwrap_or(0),
        Err(()) => return Err(Error::from(Parse::ContentLength)),
    };
    if len == 0 {
        return Ok(Bytes::new());
    }
    let len = usize::try_from(len).map_err(|_| Error::new_body_too_large())?;
    if len > limit {
        return Err(Error::new_body_too_large());
    }

    while buf.len() < len {
        let n = io.read_buf(buf).await.map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_incomplete());
        }
    }
    Ok(buf.split_to(len).freeze())
}

/// 序列化请求并写出。`Content-Length` 在 body 非空且未设置时自动补上。
pub(crate) async fn write_request<W>(io: &mut W, req: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut dst = BytesMut::with_capacity(256 + req.body().len());
    encode_request(req, &mut dst);
    io.write_all(&dst).await.map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)
}

/// 序列化响应并写出。
pub(crate) async fn write_response<W>(io: &mut W, res: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut dst = BytesMut::with_capacity(256 + res.body().len());
    encode_response(res, &mut dst);
    io.write_all(&dst).await.map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)
}

/// 把请求格式化成 HTTP/1.1 线格式。
pub(crate) fn encode_request(req: &Request, dst: &mut BytesMut) {
    dst.put_slice(req.method().as_str().as_bytes());
    dst.put_u8(b' ');
    // 原始 target 优先：与读取侧对称
    match req.extensions().get::<RawTarget>() {
        Some(raw) => dst.put_slice(raw.0.as_bytes()),
        None => {
            let target = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            dst.put_slice(target.as_bytes());
        }
    }
    dst.put_slice(b" HTTP/1.1\r\n");

    encode_headers(req.headers(), dst);
    if !req.body().is_empty() && !req.headers().contains_key(CONTENT_LENGTH) {
        dst.put_slice(b"content-length: ");
        dst.put_slice(req.body().len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
    dst.put_slice(req.body());
}

/// 把响应格式化成 HTTP/1.1 线格式。
pub(crate) fn encode_response(res: &Response, dst: &mut BytesMut) {
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(res.status().as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(res.status().canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.put_slice(b"\r\n");

    encode_headers(res.headers(), dst);
    dst.put_slice(b"\r\n");
    dst.put_slice(res.body());
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

fn version_from_minor(minor: u8) -> Result<Version> {
    match minor {
        0 => Ok(Version::HTTP_10),
        1 => Ok(Version::HTTP_11),
        _ => Err(Error::from(Parse::Version)),
    }
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| Parse::Header)?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| Parse::Header)?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn block<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn parses_request_with_body_and_leftover() {
        let wire = b"POST /echo HTTP/1.1\r\nhost: a\r\ncontent-length: 4\r\n\r\nbodyGET /next".to_vec();
        let mut io = Cursor::new(wire);
        let mut buf = BytesMut::new();

        let req = block(read_request(&mut io, &mut buf, 8192)).unwrap().unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/echo");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.body().as_ref(), b"body");
        // 下一条消息的开头留在缓冲里
        assert_eq!(&buf[..], b"GET /next");
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut io = Cursor::new(Vec::new());
        let mut buf = BytesMut::new();
        assert!(block(read_request(&mut io, &mut buf, 8192)).unwrap().is_none());
    }

    #[test]
    fn truncated_message_is_incomplete() {
        let mut io = Cursor::new(b"GET / HTTP/1.1\r\nhost".to_vec());
        let mut buf = BytesMut::new();
        let err = block(read_request(&mut io, &mut buf, 8192)).unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut wire = b"GET / HTTP/1.1\r\nx: ".to_vec();
        wire.extend(std::iter::repeat(b'a').take(1024));
        wire.extend_from_slice(b"\r\n\r\n");
        let mut io = Cursor::new(wire);
        let mut buf = BytesMut::new();
        let err = block(read_request(&mut io, &mut buf, 128)).unwrap_err();
        assert!(err.is_parse_too_large());
    }

    #[test]
    fn malformed_target_is_preserved_raw() {
        let mut io = Cursor::new(b"GET ::: HTTP/1.1\r\n\r\n".to_vec());
        let mut buf = BytesMut::new();
        let req = block(read_request(&mut io, &mut buf, 8192)).unwrap().unwrap();
        // Uri 解析不了就保持默认 "/"，原始 target 进 extensions
        assert_eq!(req.extensions().get::<RawTarget>().unwrap().0, ":::");
        assert_eq!(req.uri().path(), "/");
    }

    #[test]
    fn response_round_trip() {
        let mut res = http::Response::new(Bytes::from_static(b"Hello, World!"));
        *res.status_mut() = StatusCode::OK;
        res.headers_mut()
            .insert("content-type", HeaderValue::from_static("text/plain"));
        crate::headers::set_content_length(res.headers_mut(), 13);

        let mut dst = BytesMut::new();
        encode_response(&res, &mut dst);
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nHello, World!"));

        let mut io = Cursor::new(dst.to_vec());
        let mut buf = BytesMut::new();
        let parsed = block(read_response(&mut io, &mut buf, 8192)).unwrap();
        assert_eq!(parsed.status(), StatusCode::OK);
        assert_eq!(parsed.body().as_ref(), b"Hello, World!");
    }

    #[test]
    fn request_encoding_adds_content_length() {
        let mut req = http::Request::new(Bytes::from_static(b"hi"));
        *req.method_mut() = Method::POST;
        *req.uri_mut() = Uri::from_static("/submit");

        let mut dst = BytesMut::new();
        encode_request(&req, &mut dst);
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
    }
}
