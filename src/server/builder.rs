//! 从 JSON 清单（manifest）构建服务器集合。
//!
//! 清单的根是一个对象：逻辑服务器名 → 服务器配置。每项配置：
//!
//! ```jsonc
//! {
//!   "Type": "HttpHelloWorld",   // 注册过的服务器类型
//!   "Host": "0.0.0.0",
//!   "Port": 8001,               // 数字或数字字符串都接受
//!   "Backlog": 128,             // 可选
//!   "Details": { /* 处理器配置 */ }
//! }
//! ```
//!
//! 解析允许 `//`、`/* */` 注释与结尾逗号。未知的 `Type` 记一条
//! 警告并跳过；单项构建失败同样跳过，不影响其余服务器。

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::rt::Executor;
use crate::server::{HandlerConfig, Server};
use crate::service::builtin::{HelloWorld, Matpowsum};
use crate::{Error, Result};

/// 默认监听队列长度，清单缺省 `Backlog` 时使用。
const DEFAULT_BACKLOG: i32 = 1024;

/// 示例清单，`--manifest-example` 时原样打印。
pub const EXAMPLE_MANIFEST: &str = r#"{
  // 服务器名只用于日志与管理，类型决定行为
  "hello-world": {
    "Type": "HttpHelloWorld",
    "Host": "0.0.0.0",
    "Port": 8001,
    "Backlog": 128,
    "Details": {
      "BufferLimit": 8192,
      "KeepAliveTimeout": 3,
      "KeepAliveMax": 1,
    },
  },
  "matpowsum": {
    "Type": "HttpMatpowsum",
    "Host": "127.0.0.1",
    "Port": 8002,
    "Backlog": 4096,
    "Details": {
      "BufferLimit": 8192,
      "KeepAliveTimeout": 3,
      "KeepAliveMax": null, // null 表示不限次数
    },
  },
}
"#;

/// 单个服务器的清单配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    /// 服务器类型，对应注册表里的键
    #[serde(rename = "Type")]
    pub kind: String,
    /// 监听地址（数字形式）
    pub host: String,
    /// 监听端口；接受 JSON 数字或数字字符串
    #[serde(deserialize_with = "port_number_or_string")]
    pub port: u16,
    /// 监听队列长度
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// 处理器相关的详细配置
    #[serde(default)]
    pub details: serde_json::Value,
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

/// 清单里的 `Port` 字段历史上既有数字也有字符串写法，两者都接受。
fn port_number_or_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u16, D::Error> {
    struct PortVisitor;

    impl Visitor<'_> for PortVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a port number or a numeric string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom("port out of range"))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom("port out of range"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<u16, E> {
            v.parse().map_err(|_| E::custom("port is not numeric"))
        }
    }

    d.deserialize_any(PortVisitor)
}

/// 类型擦除后的服务器，供异构集合持有。
pub trait BuiltServer: Send + Sync + std::fmt::Debug {
    /// 同 [`Server::start`]。
    fn start(&self, ex: &Executor, addr: SocketAddr, backlog: i32) -> Result<()>;
    /// 同 [`Server::stop`]。
    fn stop(&self);
    /// 实际监听地址。
    fn local_addr(&self) -> Option<SocketAddr>;
}

impl<S> BuiltServer for Server<S>
where
    S: crate::service::Service<crate::Request, Response = crate::Response> + Send + Sync + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send,
{
    fn start(&self, ex: &Executor, addr: SocketAddr, backlog: i32) -> Result<()> {
        Server::start(self, ex, addr, backlog)
    }

    fn stop(&self) {
        Server::stop(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Server::local_addr(self)
    }
}

/// 服务器构建函子：由名字与 `Details` 构造一个可启动的服务器。
pub type BuildServer = fn(name: &str, details: &serde_json::Value) -> Result<Box<dyn BuiltServer>>;

/// 构建结果：服务器名 → (配置, 服务器)。
pub type Servers = BTreeMap<String, (ServerConfig, Box<dyn BuiltServer>)>;

/// 服务器构建器：维护类型注册表，从清单产出服务器集合。
pub struct ServerBuilder {
    builders: BTreeMap<String, BuildServer>,
}

impl ServerBuilder {
    /// 创建空注册表的构建器。
    pub fn new() -> ServerBuilder {
        ServerBuilder {
            builders: BTreeMap::new(),
        }
    }

    /// 注册一种服务器类型。
    pub fn register_server(&mut self, name: impl Into<String>, build: BuildServer) {
        self.builders.insert(name.into(), build);
    }

    /// 注册内置的服务器类型：`HttpHelloWorld` 与 `HttpMatpowsum`。
    pub fn register_builtins(&mut self) {
        self.register_server("HttpHelloWorld", |name, details| {
            let config = handler_config(details)?;
            Ok(Box::new(Server::new(name, HelloWorld, config)))
        });
        self.register_server("HttpMatpowsum", |name, details| {
            let config = handler_config(details)?;
            Ok(Box::new(Server::new(name, Matpowsum, config)))
        });
    }

    /// 从清单文本构建服务器集合。
    pub fn build_json(&self, json: &str) -> Result<Servers> {
        let cleaned = strip_jsonc(json);
        let root: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&cleaned).map_err(Error::new_user_config)?;

        let mut servers = Servers::new();
        for (name, jval) in root {
            let cfg: ServerConfig =
                serde_json::from_value(jval).map_err(Error::new_user_config)?;

            let Some(build) = self.builders.get(&cfg.kind) else {
                warn!(server = %name, kind = %cfg.kind, "unknown server type");
                continue;
            };
            match build(&name, &cfg.details) {
                Ok(server) => {
                    servers.insert(name, (cfg, server));
                }
                Err(e) => {
                    warn!(server = %name, kind = %cfg.kind, error = %e, "unable to build server");
                }
            }
        }
        Ok(servers)
    }

    /// 从清单文件构建服务器集合。
    pub fn build_json_file(&self, path: &str) -> Result<Servers> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::new_user_config(format!("failed to open {path}: {e}")))?;
        self.build_json(&json)
    }

    /// 启动集合里的所有服务器。启动失败的项已在各自的 `start` 里
    /// 记录日志，不影响其余项。
    pub fn start_all(ex: &Executor, servers: &Servers) {
        for (name, (cfg, server)) in servers {
            let ip: IpAddr = match cfg.host.parse() {
                Ok(ip) => ip,
                Err(e) => {
                    warn!(server = %name, host = %cfg.host, error = %e, "invalid host");
                    continue;
                }
            };
            let _ = server.start(ex, SocketAddr::new(ip, cfg.port), cfg.backlog);
        }
    }

    /// 停止集合里的所有服务器。
    pub fn stop_all(servers: &Servers) {
        for (_, (_, server)) in servers {
            server.stop();
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("types", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn handler_config(details: &serde_json::Value) -> Result<HandlerConfig> {
    if details.is_null() {
        return Ok(HandlerConfig::default());
    }
    serde_json::from_value(details.clone()).map_err(Error::new_user_config)
}

/// 去掉 JSON 里的注释与结尾逗号，让标准解析器能接受宽松写法。
///
/// 字符串字面量里的内容原样保留；注释外的 `,` 若后面只隔着空白就
/// 遇到 `}` 或 `]`，则被丢弃。
fn strip_jsonc(input: &str) -> String {
    enum State {
        Normal,
        InString,
        LineComment,
        BlockComment,
    }

    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut state = State::Normal;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match state {
            State::Normal => match c {
                '"' => {
                    state = State::InString;
                    out.push(c);
                }
                '/' if chars.get(i + 1) == Some(&'/') => {
                    state = State::LineComment;
                    i += 1;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                ',' => {
                    // 向前看：只隔空白与注释就闭合的逗号是多余的
                    if !closes_after_comma(&chars, i + 1) {
                        out.push(c);
                    }
                }
                _ => out.push(c),
            },
            State::InString => {
                out.push(c);
                if c == '\\' {
                    // 转义序列整体拷贝
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                        i += 1;
                    }
                } else if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                    out.push(c);
                }
            }
            State::BlockComment => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    state = State::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    out
}

/// 逗号之后跳过空白与注释，看是否直接闭合。
fn closes_after_comma(chars: &[char], mut i: usize) -> bool {
    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
            }
            '}' | ']' => return true,
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_manifest_builds() {
        let mut sb = ServerBuilder::new();
        sb.register_builtins();
        let servers = sb.build_json(EXAMPLE_MANIFEST).unwrap();
        assert_eq!(servers.len(), 2);

        let (cfg, _) = &servers["hello-world"];
        assert_eq!(cfg.kind, "HttpHelloWorld");
        assert_eq!(cfg.port, 8001);
        assert_eq!(cfg.backlog, 128);

        let (cfg, _) = &servers["matpowsum"];
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8002);
    }

    #[test]
    fn port_accepts_number_or_numeric_string() {
        let mut sb = ServerBuilder::new();
        sb.register_builtins();
        let servers = sb
            .build_json(
                r#"{ "a": { "Type": "HttpHelloWorld", "Host": "0.0.0.0", "Port": "8080" } }"#,
            )
            .unwrap();
        assert_eq!(servers["a"].0.port, 8080);
        assert_eq!(servers["a"].0.backlog, DEFAULT_BACKLOG);

        let err = sb
            .build_json(r#"{ "a": { "Type": "HttpHelloWorld", "Host": "h", "Port": "zz" } }"#)
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unknown_type_is_skipped() {
        let mut sb = ServerBuilder::new();
        sb.register_builtins();
        let servers = sb
            .build_json(
                r#"{
                    "good": { "Type": "HttpHelloWorld", "Host": "0.0.0.0", "Port": 1 },
                    "bad": { "Type": "NoSuchServer", "Host": "0.0.0.0", "Port": 2 }
                }"#,
            )
            .unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers.contains_key("good"));
    }

    #[test]
    fn jsonc_stripping() {
        let src = r#"{
            // 行注释
            "a": 1, /* 块注释 */
            "b": [1, 2, 3,],
            "s": "keep // this /* and */ this,",
        }"#;
        let cleaned = strip_jsonc(src);
        let v: serde_json::Value = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(v["a"], 1);
        assert_eq!(v["b"].as_array().unwrap().len(), 3);
        assert_eq!(v["s"], "keep // this /* and */ this,");
    }

    #[test]
    fn details_flow_into_handler_config() {
        let details: serde_json::Value = serde_json::from_str(
            r#"{ "BufferLimit": 1024, "KeepAliveTimeout": 7, "KeepAliveMax": null }"#,
        )
        .unwrap();
        let config = handler_config(&details).unwrap();
        assert_eq!(config.buffer_limit, 1024);
        assert_eq!(config.keep_alive_timeout, 7);
        assert_eq!(config.keep_alive_max, None);

        let config = handler_config(&serde_json::Value::Null).unwrap();
        assert_eq!(config.buffer_limit, 8 << 10);
    }
}
