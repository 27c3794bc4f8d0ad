//! 一次性请求辅助函数
//!
//! [`request`] 缓冲整个响应；[`stream`] 在响应头到达时即 resolve，之后逐段交出响应体。
//!
//! 两者都只解析一次 URL：origin 用于路由，路径加查询串作为请求目标。
//! 请求在函数返回前已经调度出去，即使返回的 future 从未被 poll。
//!
//! ```no_run
//! # async fn run() -> hyper_agent::Result<()> {
//! let res = hyper_agent::request("http://example.com/", Default::default())?.await?;
//! println!("{}: {} bytes", res.status, res.body.len());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::common::origin::{self, Parts};
use crate::dispatcher::{Dispatch, DispatchOptions, Handler};
use crate::error::Error;
use crate::global::global_dispatcher;

/// [`request`] 与 [`stream`] 的选项。
#[derive(Clone)]
pub struct RequestOptions {
    /// 调度目标，默认为全局 dispatcher
    pub dispatcher: Option<Arc<dyn Dispatch>>,
    /// 请求方法，默认 `GET`
    pub method: Method,
    /// 必须留空：路径总是取自 URL
    pub path: Option<String>,
    /// 请求头
    pub headers: HeaderMap,
    /// 可选的请求体
    pub body: Option<Bytes>,
}

/// 完整缓冲的响应。
#[derive(Clone, Debug)]
pub struct ResponseData {
    /// 响应状态码
    pub status: StatusCode,
    /// 响应头
    pub headers: HeaderMap,
    /// 完整的响应体
    pub body: Bytes,
    /// 服务端发送的 trailers（如有）
    pub trailers: Option<HeaderMap>,
}

/// resolve 为 [`ResponseData`] 的 future。
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<crate::Result<ResponseData>>,
}

/// 响应体仍在到达中的响应。
#[derive(Debug)]
pub struct StreamResponse {
    /// 响应状态码
    pub status: StatusCode,
    /// 响应头
    pub headers: HeaderMap,
    /// 响应体
    pub body: BodyStream,
}

/// [`StreamResponse`] 的响应体。
pub struct BodyStream {
    rx: mpsc::UnboundedReceiver<Message>,
    trailers: Option<HeaderMap>,
}

/// resolve 为 [`StreamResponse`] 的 future。
#[must_use = "futures do nothing unless polled"]
pub struct StreamFuture {
    head: oneshot::Receiver<crate::Result<(StatusCode, HeaderMap)>>,
    body: Option<mpsc::UnboundedReceiver<Message>>,
}

enum Message {
    Data(Bytes),
    Trailers(HeaderMap),
    Error(Error),
}

/// 向 `url` 发送请求并缓冲响应。
///
/// `url` 不是绝对 URL、设置了 `options.path` 或 dispatcher 拒绝请求时立即失败。
pub fn request(url: &str, options: RequestOptions) -> crate::Result<ResponseFuture> {
    let (dispatcher, options) = prepare(url, options)?;
    let (tx, rx) = oneshot::channel();
    dispatcher.dispatch(
        options,
        Box::new(Collect {
            tx: Some(tx),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }),
    )?;
    Ok(ResponseFuture { rx })
}

/// 向 `url` 发送请求并以流的形式交出响应体。
///
/// 立即失败的条件与 [`request`] 相同。
pub fn stream(url: &str, options: RequestOptions) -> crate::Result<StreamFuture> {
    let (dispatcher, options) = prepare(url, options)?;
    let (head_tx, head) = oneshot::channel();
    let (body_tx, body) = mpsc::unbounded_channel();
    dispatcher.dispatch(
        options,
        Box::new(Forward {
            head: Some(head_tx),
            body: Some(body_tx),
        }),
    )?;
    Ok(StreamFuture {
        head,
        body: Some(body),
    })
}

fn prepare(
    url: &str,
    options: RequestOptions,
) -> crate::Result<(Arc<dyn Dispatch>, DispatchOptions)> {
    if options.path.is_some() {
        return Err(Error::new_unsupported_path());
    }
    let Parts { origin, path } = origin::split(url)?;
    let dispatcher = options.dispatcher.unwrap_or_else(global_dispatcher);

    Ok((
        dispatcher,
        DispatchOptions {
            origin: Some(origin),
            method: options.method,
            path,
            headers: options.headers,
            body: options.body,
        },
    ))
}

// ===== impl RequestOptions

impl RequestOptions {
    /// 创建调度到 `dispatcher` 的选项。
    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatch>) -> RequestOptions {
        RequestOptions {
            dispatcher: Some(dispatcher),
            ..RequestOptions::default()
        }
    }
}

impl Default for RequestOptions {
    fn default() -> RequestOptions {
        RequestOptions {
            dispatcher: None,
            method: Method::GET,
            path: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("dispatcher", &self.dispatcher.as_ref().map(|_| "custom"))
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

// ===== impl ResponseFuture

impl Future for ResponseFuture {
    type Output = crate::Result<ResponseData>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::new_canceled())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish()
    }
}

// ===== impl StreamFuture

impl Future for StreamFuture {
    type Output = crate::Result<StreamResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (status, headers) = match Pin::new(&mut self.head).poll(cx) {
            Poll::Ready(Ok(head)) => head?,
            Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::new_canceled())),
            Poll::Pending => return Poll::Pending,
        };
        match self.body.take() {
            Some(rx) => Poll::Ready(Ok(StreamResponse {
                status,
                headers,
                body: BodyStream { rx, trailers: None },
            })),
            None => Poll::Ready(Err(Error::new_canceled())),
        }
    }
}

impl fmt::Debug for StreamFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFuture").finish()
    }
}

// ===== impl BodyStream

impl BodyStream {
    /// 等待下一段响应体；响应体结束后返回 `None`。
    pub async fn chunk(&mut self) -> Option<crate::Result<Bytes>> {
        loop {
            match self.rx.recv().await? {
                Message::Data(chunk) => return Some(Ok(chunk)),
                Message::Trailers(trailers) => self.trailers = Some(trailers),
                Message::Error(err) => return Some(Err(err)),
            }
        }
    }

    /// [`chunk`](BodyStream::chunk) 返回 `None` 之后，服务端发送的 trailers。
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// 把剩余响应体读进一个缓冲区。
    pub async fn collect(&mut self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("trailers", &self.trailers)
            .finish()
    }
}

// ===== handlers

struct Collect {
    tx: Option<oneshot::Sender<crate::Result<ResponseData>>>,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Handler for Collect {
    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.status = status;
        self.headers = headers.clone();
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.body.extend_from_slice(&chunk);
    }

    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(ResponseData {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
                body: std::mem::take(&mut self.body).freeze(),
                trailers,
            }));
        }
    }

    fn on_error(&mut self, err: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

struct Forward {
    head: Option<oneshot::Sender<crate::Result<(StatusCode, HeaderMap)>>>,
    body: Option<mpsc::UnboundedSender<Message>>,
}

impl Forward {
    fn send(&self, message: Message) {
        if let Some(ref body) = self.body {
            let _ = body.send(message);
        }
    }
}

impl Handler for Forward {
    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap) {
        if let Some(head) = self.head.take() {
            let _ = head.send(Ok((status, headers.clone())));
        }
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.send(Message::Data(chunk));
    }

    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        if let Some(trailers) = trailers {
            self.send(Message::Trailers(trailers));
        }
        self.body = None;
    }

    fn on_error(&mut self, err: Error) {
        match self.head.take() {
            Some(head) => {
                let _ = head.send(Err(err));
            }
            None => self.send(Message::Error(err)),
        }
        self.body = None;
    }
}
