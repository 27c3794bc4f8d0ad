//! 调用者、agent 与连接池之间的契约
//!
//! [`Dispatch`] 接受由 [`DispatchOptions`] 描述的请求，之后把结果报告给
//! [`Handler`]，从不阻塞调用者。
//!
//! [`Pool`] 是绑定到单一 origin 的 dispatcher，另外暴露负载计数、生命周期事件
//! 和关闭操作，[`Agent`](crate::Agent) 的工厂产出的就是它。

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};

use crate::error::Error;
use crate::event::{Listener, Subscription};

/// 描述一个待调度的请求。
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// 目标的 `scheme://host[:port]`；必填且不能为空
    pub origin: Option<String>,
    /// 请求方法，默认 `GET`
    pub method: Method,
    /// 请求目标：路径加可选的查询串，默认 `/`
    pub path: String,
    /// 请求头；缺少 `host` 时由 origin 补上
    pub headers: HeaderMap,
    /// 可选的请求体
    pub body: Option<Bytes>,
}

/// 接收一个已调度请求的结果。
///
/// 请求结束前 `on_headers` 与 `on_data` 可被调用任意次；最后恰好调用
/// `on_complete` 或 `on_error` 之一。
pub trait Handler: Send + 'static {
    /// 收到响应头。
    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap) {
        let _ = (status, headers);
    }

    /// 收到一段响应体。
    fn on_data(&mut self, chunk: Bytes) {
        let _ = chunk;
    }

    /// 响应结束；对端发送了 trailers 时一并给出。
    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        let _ = trailers;
    }

    /// 请求失败。
    fn on_error(&mut self, err: Error);
}

/// 可以接受请求调度的对象。
pub trait Dispatch: Send + Sync + 'static {
    /// 排入一个请求并立即返回。
    ///
    /// 返回 `Ok(false)` 表示 dispatcher 已繁忙，调用者应等待 drain 事件后再继续调度。
    /// 违反前置条件时在排队前直接返回错误，之后的所有结果都交给 `handler`。
    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn Handler>) -> crate::Result<bool>;
}

/// 持有到单一 origin 所有连接的 dispatcher。
pub trait Pool: Dispatch {
    /// 已连接的 socket 数。
    fn connected(&self) -> usize;

    /// 排队中与进行中的请求数。
    fn size(&self) -> usize;

    /// 等待连接的请求数。
    fn pending(&self) -> usize;

    /// 正在进行的请求数。
    fn running(&self) -> usize;

    /// 为本池的生命周期事件注册监听者。
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// 停止接受新请求；已排队的请求完成且连接关闭后 resolve。
    fn close(&self) -> BoxFuture<'static, crate::Result<()>>;

    /// 立即拆除一切，排队中与进行中的请求均以错误结束。
    fn destroy(&self) -> BoxFuture<'static, crate::Result<()>>;
}

// ===== impl DispatchOptions =====

impl DispatchOptions {
    /// 创建发往 `origin` 的 `GET /`。
    pub fn new(origin: impl Into<String>) -> DispatchOptions {
        DispatchOptions {
            origin: Some(origin.into()),
            ..DispatchOptions::default()
        }
    }

    /// 返回 origin，并检查它存在且非空。
    pub(crate) fn checked_origin(&self) -> crate::Result<&str> {
        match self.origin.as_deref() {
            Some(origin) if !origin.is_empty() => Ok(origin),
            _ => Err(Error::new_invalid_origin()),
        }
    }
}

impl Default for DispatchOptions {
    fn default() -> DispatchOptions {
        DispatchOptions {
            origin: None,
            method: Method::GET,
            path: "/".to_owned(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}
