//! 错误与结果类型模块
//!
//! 本模块定义了 crate 对外暴露的唯一错误类型 [`Error`]。参数错误、建连失败、
//! 连接中途出错以及 dispatcher 关闭或销毁，都统一封装在 `Error` 中，
//! 调用者通过 `is_*` 方法判断错误类别。内部分类（`Kind`、`InvalidArgument`）
//! 仅在 crate 内可见。
//!
//! ## informational 类错误
//!
//! [`Informational`] 标记那些只是报告某种状况、并不说明 TLS 状态已损坏的传输错误。
//! 它们和其他错误一样交给处理器，但不会使缓存的 TLS 会话失效。

// 标准库的 Error trait 重命名为 StdError，避免与本模块的 Error 冲突
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

/// crate 中方法常用的 Result 类型别名。
pub type Result<T> = std::result::Result<T, Error>;

// 类型擦除的错误原因，Send + Sync 以便跨任务传递
type Cause = Box<dyn StdError + Send + Sync>;

/// 向 origin 调度请求时可能发生的错误。
///
/// # 格式化
///
/// `Display` 只打印当前层级的错误，即使它由另一个错误引起并把该错误作为 source。
/// 要打印包括 source 链在内的全部信息，请使用 `std::error::Report` 或等效的第三方类型。
///
/// 格式化后的错误消息内容是未指定的。**不能依赖它。** 措辞和细节可能在任何版本中更改。
///
/// # Source
///
/// `Error` 可能由另一个错误引起，这些错误通过 `Error::source()` 以类型擦除的方式暴露。
/// 虽然可以检查 source 的确切类型，但**不能依赖它们**，它们可能来自私有的内部依赖。
pub struct Error {
    // Box 使 Error 只有一个指针宽，Result<T, Error> 因此保持小巧
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Clone, Debug)]
pub(super) enum Kind {
    /// 调用者违反了调用的前置条件
    InvalidArgument(InvalidArgument),
    /// 无法建立到 origin 的传输
    Connect,
    /// 已建立的连接出错
    Http,
    /// informational 类的传输错误
    Informational,
    /// dispatcher 已关闭，不再接受新请求
    Closed,
    /// dispatcher 在请求排队或进行中时被销毁
    Destroyed,
    /// 排队的请求在处理前被丢弃
    Canceled,
    /// 在 tokio 运行时之外调度
    Runtime,
}

#[derive(Clone, Copy, Debug)]
pub(super) enum InvalidArgument {
    /// dispatch 缺少 origin，或 origin 为空、无法解析
    Origin,
    /// 向从 URL 推导路径的辅助函数传入了 path
    Path,
    /// URL 无法解析
    Url,
    /// 连接数上限为 0
    Connections,
    /// TLS server name 既不是合法的 DNS 名也不是 IP 地址
    ServerName,
}

/// informational 类错误。
///
/// 直接携带此类型、或以它作为 [`io::Error`] 载荷的传输错误，报告的是一种状况，
/// 而不是连接 TLS 状态的失效：它们照常交给处理器，但从不淘汰缓存的 TLS 会话。
#[derive(Debug)]
pub struct Informational {
    message: &'static str,
}

impl Error {
    /// 调用者违反了调用的前置条件时返回 true。
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidArgument(_))
    }

    /// 错误发生在建立连接时返回 true。
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// 错误来自已建立的 HTTP 连接时返回 true。
    pub fn is_http(&self) -> bool {
        matches!(self.inner.kind, Kind::Http)
    }

    /// 属于 informational 类传输错误时返回 true。
    pub fn is_informational(&self) -> bool {
        matches!(self.inner.kind, Kind::Informational)
            || self.find_source::<Informational>().is_some()
    }

    /// dispatcher 已关闭时返回 true。
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// dispatcher 已被销毁时返回 true。
    pub fn is_destroyed(&self) -> bool {
        matches!(self.inner.kind, Kind::Destroyed)
    }

    /// 请求被取消时返回 true。
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            // io::Error::source 会跳过它自己的载荷
            if let Some(payload) = err.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
                if let Some(typed) = payload.downcast_ref() {
                    return Some(typed);
                }
            }
            cause = err.source();
        }

        None
    }

    /// 创建同类错误，并以共享的 `err` 作为 source。
    ///
    /// 同一失败需要报告给多方时使用。
    pub(crate) fn shared(err: &Arc<Error>) -> Error {
        Error::new(err.inner.kind.clone()).with(err.clone())
    }

    fn new_invalid(arg: InvalidArgument) -> Error {
        Error::new(Kind::InvalidArgument(arg))
    }

    pub(super) fn new_invalid_origin() -> Error {
        Error::new_invalid(InvalidArgument::Origin)
    }

    pub(super) fn new_unsupported_path() -> Error {
        Error::new_invalid(InvalidArgument::Path)
    }

    pub(super) fn new_invalid_url<E: Into<Cause>>(cause: E) -> Error {
        Error::new_invalid(InvalidArgument::Url).with(cause)
    }

    pub(super) fn new_invalid_connections() -> Error {
        Error::new_invalid(InvalidArgument::Connections)
    }

    pub(super) fn new_invalid_server_name<E: Into<Cause>>(cause: E) -> Error {
        Error::new_invalid(InvalidArgument::ServerName).with(cause)
    }

    pub(super) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(super) fn new_http(cause: hyper::Error) -> Error {
        Error::new(Kind::Http).with(cause)
    }

    pub(super) fn new_informational(message: &'static str) -> Error {
        Error::new(Kind::Informational).with(Informational::new(message))
    }

    pub(super) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(super) fn new_destroyed() -> Error {
        Error::new(Kind::Destroyed)
    }

    pub(super) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(super) fn new_runtime<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Runtime).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::InvalidArgument(InvalidArgument::Origin) => "origin must be a non-empty string",
            Kind::InvalidArgument(InvalidArgument::Path) => "unsupported path option",
            Kind::InvalidArgument(InvalidArgument::Url) => "invalid URL",
            Kind::InvalidArgument(InvalidArgument::Connections) => {
                "connections must be a positive number"
            }
            Kind::InvalidArgument(InvalidArgument::ServerName) => "invalid TLS server name",
            Kind::Connect => "error trying to connect",
            Kind::Http => "connection error",
            Kind::Informational => "informational transport error",
            Kind::Closed => "dispatcher is closed",
            Kind::Destroyed => "dispatcher was destroyed",
            Kind::Canceled => "operation was canceled",
            Kind::Runtime => "dispatch requires a tokio runtime",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hyper_agent::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

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
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

// ===== impl Informational =====

impl Informational {
    /// 以静态消息创建 informational 错误。
    pub fn new(message: &'static str) -> Informational {
        Informational { message }
    }

    /// 包装为传输层报告时使用的 `io::Error`。
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

impl fmt::Display for Informational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

impl StdError for Informational {}

/// 传输错误属于 informational 类时返回 true。
pub(crate) fn is_informational(err: &io::Error) -> bool {
    err.get_ref()
        .map_or(false, |inner| inner.is::<Informational>())
}
