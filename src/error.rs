//! httpool 错误与结果类型模块
//!
//! 本模块定义了 httpool 的核心错误类型 [`Error`]。库中所有可能的失败——
//! HTTP 解析错误、I/O 错误、超时、配置错误、重试耗尽等——都被统一封装在
//! `Error` 中，并通过 `is_*` 方法对外提供类别查询。
//!
//! ## 在 httpool 中的角色
//!
//! `Error` 是 httpool 对外暴露的唯一错误类型（通过 `lib.rs` 中的 `pub use`
//! 导出）。内部分类（`Kind`、`Parse`、`User`）是 `pub(super)` 可见性，
//! 仅供 crate 内部构造使用。错误从不跨越异步边界抛出：每个状态机步骤都把
//! 失败收敛为一个 `Error` 值再向上传递。
//!
//! ## 设计理念
//!
//! - **不透明错误**：`Error` 使用 `Box<ErrorImpl>` 包装内部实现，栈上仅占
//!   一个指针宽度，同时隐藏内部结构细节。
//! - **错误链**：通过 `std::error::Error::source()` 支持错误链；
//!   超时通过在错误链中查找 [`TimedOut`] 哨兵类型来识别。

// 标准库 Error trait 重命名为 StdError，避免与本模块的 Error 冲突
use std::error::Error as StdError;
use std::fmt;

/// httpool 方法常用的 Result 类型别名。
pub type Result<T> = std::result::Result<T, Error>;

/// 类型擦除的错误原因。`Send + Sync` 约束保证错误可以跨线程传递。
type Cause = Box<dyn StdError + Send + Sync>;

/// 表示处理 HTTP 流或池化资源时可能发生的错误。
///
/// # 格式化
///
/// `Display` 实现只打印当前层级的错误详情，不包含 source 链。
/// 错误消息的具体措辞是未指定的，不应依赖。
///
/// # Source
///
/// 底层原因通过 `Error::source()` 以类型擦除的方式暴露，便于调试；
/// 具体类型随时可能更改，同样不应依赖。
pub struct Error {
    // Box 使 Error 栈大小仅为一个指针宽度，优化 Result<T, Error> 的尺寸
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

/// 错误分类枚举，crate 内部使用。
#[derive(Debug)]
pub(super) enum Kind {
    /// HTTP 解析错误，包含具体的解析错误子类型
    Parse(Parse),
    /// 用户代码引起的错误
    User(User),
    /// 消息在完成之前遇到了 EOF（连接关闭）
    IncompleteMessage,
    /// 读写网络流时发生的 `io::Error`
    Io,
    /// 某个 I/O 步骤超出了截止时间
    Timeout,
    /// 客户端的重试预算已经耗尽
    RetryExhausted,
}

/// HTTP 解析错误的子分类。
#[derive(Debug)]
pub(super) enum Parse {
    /// 无效的 HTTP 方法
    Method,
    /// 无效的 HTTP 版本号
    Version,
    /// 无效的 URI
    Uri,
    /// 头部包含无效的 token 字符
    Header,
    /// 无效的 Content-Length 头部值
    ContentLength,
    /// 消息头部超出缓冲区限制
    TooLarge,
    /// 无效的 HTTP 状态码
    Status,
}

/// 用户代码引起的错误的子分类。
#[derive(Debug)]
pub(super) enum User {
    /// 配置无效，在 `start`/`build` 时同步报告
    Config,
    /// 消息体超出了会话缓冲区限制
    BodyTooLarge,
}

/// 哨兵类型，用于标识错误由超时引起。
///
/// 通过 `Error::find_source::<TimedOut>()` 在错误链中查找来判断。
// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(super) struct TimedOut;

impl Error {
    /// 如果这是一个 HTTP 解析错误，返回 `true`。
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// 如果这是一个由消息过大引起的解析错误，返回 `true`。
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// 如果此错误由调用方引起（配置无效、超限的消息体），返回 `true`。
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// 如果此错误是无效配置引起的，返回 `true`。
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::Config))
    }

    /// 如果连接在消息完成之前就关闭了，返回 `true`。
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// 如果错误发生在底层 I/O 上，返回 `true`。
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// 如果错误由超时引起，返回 `true`。
    ///
    /// 检查两种情况：`Timeout` 分类本身，以及错误链中的 [`TimedOut`] 哨兵。
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }
        self.find_source::<TimedOut>().is_some()
    }

    /// 如果客户端的重试预算已经耗尽，返回 `true`。
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::RetryExhausted)
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    /// 为已有的 `Error` 附加一个错误原因，builder 风格链式调用。
    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// 在错误的 source 链中查找特定类型的错误。
    ///
    /// 遍历整个错误链，尝试将每个错误向下转型为目标类型 `E`。
    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    pub(super) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(super) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(super) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    /// 创建一个超时错误，同时在错误链中埋入 `TimedOut` 哨兵。
    pub(super) fn new_timeout() -> Error {
        Error::new(Kind::Timeout).with(TimedOut)
    }

    pub(super) fn new_retry_exhausted<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::RetryExhausted).with(cause)
    }

    pub(super) fn new_user_config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::User(User::Config)).with(cause)
    }

    pub(super) fn new_body_too_large() -> Error {
        Error::new(Kind::User(User::BodyTooLarge))
    }

    /// 获取当前错误的人类可读描述字符串，`Display` 实现的核心。
    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Io => "connection error",
            Kind::Timeout => "operation exceeded its deadline",
            Kind::RetryExhausted => "request retry budget exhausted",
            Kind::User(User::Config) => "invalid configuration",
            Kind::User(User::BodyTooLarge) => "message body exceeds buffer limit",
        }
    }
}

/// 输出格式为 `httpool::Error(Kind, Cause)`。
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("httpool::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

/// 仅显示当前层级的错误描述，是否展示完整错误链由调用者决定。
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            // &Box<dyn StdError + Send + Sync> -> &(dyn StdError + 'static)
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

/// 将 `httparse` 的错误类型映射到内部的 `Parse` 枚举，
/// 使底层解析错误无缝融入 httpool 的错误体系。
impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::status::InvalidStatusCode> for Parse {
    fn from(_: http::status::InvalidStatusCode) -> Parse {
        Parse::Status
    }
}

impl From<http::uri::InvalidUri> for Parse {
    fn from(_: http::uri::InvalidUri) -> Parse {
        Parse::Uri
    }
}

// ===== impl TimedOut =====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

/// 空实现——`TimedOut` 没有 source，仅作为错误链中的标记使用。
impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    /// 利用 trait bound 在编译时检查 T: Send + Sync + 'static。
    fn assert_send_sync<T: Send + Sync + 'static>() {}

    /// 错误经常跨线程传递，必须满足 Send + Sync。
    #[test]
    fn error_satisfies_send_sync() {
        assert_send_sync::<Error>()
    }

    /// 由于使用了 `Box<ErrorImpl>`，Error 在栈上只占一个指针的大小。
    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    /// 超时错误既能通过分类识别，也能通过错误链中的哨兵识别。
    #[test]
    fn timeout_detected_through_chain() {
        let direct = Error::new_timeout();
        assert!(direct.is_timeout());

        // 包装一层后仍然可以通过 find_source 找到哨兵
        let wrapped = Error::new_retry_exhausted(direct);
        assert!(wrapped.is_timeout());
        assert!(wrapped.is_retry_exhausted());
    }

    #[test]
    fn httparse_errors_map_to_parse() {
        let err = Error::from(Parse::from(httparse::Error::Version));
        assert!(err.is_parse());
        assert!(!err.is_timeout());
    }
}
