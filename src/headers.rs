//! HTTP 头部解析与操作工具模块
//!
//! 提供 `Connection`、`Content-Length`、`Keep-Alive` 等关键头部的小工具，
//! 被协议编解码层（`proto`）、服务端处理器与客户端共同使用。
//! 所有函数都是 `pub(crate)` 可见性，仅供 crate 内部使用。

use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, Version};

/// 检查 `Connection` 头部是否包含 `keep-alive` 指令。
pub(crate) fn connection_keep_alive(value: &HeaderValue) -> bool {
    connection_has(value, "keep-alive")
}

/// 检查 `Connection` 头部是否包含 `close` 指令。
pub(crate) fn connection_close(value: &HeaderValue) -> bool {
    connection_has(value, "close")
}

/// 检查 `Connection` 头部值中是否包含指定的连接选项。
///
/// `Connection` 可以携带逗号分隔的多个值（如 `keep-alive, Upgrade`），
/// 逐一做 ASCII 大小写不敏感比较。
fn connection_has(value: &HeaderValue, needle: &str) -> bool {
    if let Ok(s) = value.to_str() {
        for val in s.split(',') {
            if val.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

/// 按 HTTP/1.1 规则判断一条消息是否希望保持连接：
/// `Connection: close` ⇒ 否；HTTP/1.1 默认保持；
/// 更老的版本需要显式 `Connection: keep-alive`。
pub(crate) fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    match headers.get(CONNECTION) {
        Some(value) => {
            if connection_close(value) {
                false
            } else if version == Version::HTTP_11 {
                true
            } else {
                connection_keep_alive(value)
            }
        }
        None => version == Version::HTTP_11,
    }
}

/// 从 `HeaderMap` 中解析 `Content-Length`。
///
/// 多个同名头部的值必须完全一致（RFC 7230 §3.3.2），否则视为错误
/// 返回 `Err(())`；头部缺失返回 `Ok(None)`。
pub(crate) fn content_length_parse(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    let mut content_length: Option<u64> = None;
    for h in headers.get_all(CONTENT_LENGTH) {
        let line = h.to_str().map_err(|_| ())?;
        for v in line.split(',') {
            let n = from_digits(v.trim().as_bytes()).ok_or(())?;
            if content_length.is_none() {
                content_length = Some(n);
            } else if content_length != Some(n) {
                return Err(());
            }
        }
    }
    Ok(content_length)
}

/// 覆盖式写入 `Content-Length`，响应侧永远以实际 body 长度为准。
pub(crate) fn set_content_length(headers: &mut HeaderMap, len: u64) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

/// `Keep-Alive` 头部携带的参数。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeepAliveParams {
    /// `timeout=<秒>`
    pub(crate) timeout: Option<u64>,
    /// `max=<次数>`
    pub(crate) max: Option<u64>,
}

/// 解析 `Keep-Alive` 头部值：大小写不敏感的逗号分隔参数
/// `timeout=<uint>` 与 `max=<uint>`。无法解析的参数被忽略。
pub(crate) fn keep_alive_params(value: &HeaderValue) -> KeepAliveParams {
    let mut params = KeepAliveParams::default();
    let Ok(s) = value.to_str() else {
        return params;
    };
    for part in s.split(',') {
        let Some((name, v)) = part.split_once('=') else {
            continue;
        };
        let name = name.trim();
        let v = from_digits(v.trim().as_bytes());
        if name.eq_ignore_ascii_case("timeout") {
            params.timeout = v.or(params.timeout);
        } else if name.eq_ignore_ascii_case("max") {
            params.max = v.or(params.max);
        }
    }
    params
}

/// 从字节切片中解析无符号整数。
///
/// 不走 `str::parse::<u64>()`：标准库允许 `+` 前缀，而 HTTP 的数字
/// 字段不允许符号；输入也未必是合法 UTF-8。溢出返回 `None`。
fn from_digits(bytes: &[u8]) -> Option<u64> {
    // cannot use FromStr for u64, since it allows a signed prefix
    let mut result = 0u64;
    const RADIX: u64 = 10;

    if bytes.is_empty() {
        return None;
    }

    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(RADIX)?;
                result = result.checked_add((b - b'0') as u64)?;
            }
            _ => {
                // not a DIGIT, get outta here!
                return None;
            }
        }
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hv(s: &str) -> HeaderValue {
        HeaderValue::from_str(s).unwrap()
    }

    #[test]
    fn connection_tokens() {
        assert!(connection_keep_alive(&hv("keep-alive")));
        assert!(connection_keep_alive(&hv("Keep-Alive")));
        assert!(connection_keep_alive(&hv("upgrade, keep-alive")));
        assert!(!connection_keep_alive(&hv("close")));
        assert!(connection_close(&hv("close")));
        assert!(connection_close(&hv(" CLOSE ")));
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let empty = HeaderMap::new();
        assert!(wants_keep_alive(Version::HTTP_11, &empty));
        assert!(!wants_keep_alive(Version::HTTP_10, &empty));

        let mut close = HeaderMap::new();
        close.insert(CONNECTION, hv("close"));
        assert!(!wants_keep_alive(Version::HTTP_11, &close));

        let mut ka = HeaderMap::new();
        ka.insert(CONNECTION, hv("keep-alive"));
        assert!(wants_keep_alive(Version::HTTP_10, &ka));
    }

    #[test]
    fn content_length_consistency() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length_parse(&headers), Ok(None));

        headers.insert(CONTENT_LENGTH, hv("42"));
        assert_eq!(content_length_parse(&headers), Ok(Some(42)));

        headers.append(CONTENT_LENGTH, hv("42"));
        assert_eq!(content_length_parse(&headers), Ok(Some(42)));

        headers.append(CONTENT_LENGTH, hv("7"));
        assert!(content_length_parse(&headers).is_err());

        let mut bad = HeaderMap::new();
        bad.insert(CONTENT_LENGTH, hv("+7"));
        assert!(content_length_parse(&bad).is_err());
    }

    #[test]
    fn keep_alive_parameter_grammar() {
        let p = keep_alive_params(&hv("timeout=5, max=100"));
        assert_eq!(p.timeout, Some(5));
        assert_eq!(p.max, Some(100));

        // 大小写不敏感、顺序无关
        let p = keep_alive_params(&hv("MAX=3,Timeout=1"));
        assert_eq!(p.timeout, Some(1));
        assert_eq!(p.max, Some(3));

        // 垃圾参数被忽略
        let p = keep_alive_params(&hv("timeout=abc, other=1"));
        assert_eq!(p, KeepAliveParams::default());
    }
}
