//! 单一 origin 的连接池
//!
//! 本模块提供 [`Agent`](crate::Agent) 工厂产出的两种池：
//!
//! - [`Client`]：至多持有一条 HTTP/1.1 连接，请求逐个发送；
//! - [`ClientPool`]：把请求分摊到同一 origin 的多个 `Client` 上。
//!
//! 两者都实现 [`Pool`](crate::Pool)，因此都可以放在 agent 后面。
//!
//! ## Client 的内部结构
//!
//! - 首次 dispatch 时在当前 tokio 运行时上启动一个后台 worker 任务；
//! - worker 从队列取出请求，需要时通过 [`Connector`] 建立连接，
//!   并用 `hyper::client::conn::http1` 完成握手与收发；
//! - 连接任务结束时报告 disconnect：对端正常关闭为 informational 错误，
//!   其余为 HTTP 错误；
//! - 建连失败时，当前请求与队列中的请求都以该错误失败，随后才发出 disconnect，
//!   此时 `size() == 0`，agent 可以回收这个池。
//!
//! 所有状态变更都在 `State` 锁内完成，处理器回调与事件发送总在锁外进行。

// 标准库：请求队列、格式化、路径与共享状态
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

// 请求体与 close / destroy 返回的装箱 Future
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderValue, HOST};
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
// HTTP/1.1 连接握手，以及把 tokio I/O 适配为 hyper 的 I/O trait
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
// worker 任务的启动、唤醒与结束通知
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::common::lock;
use crate::connect::{self, Connector, Target};
use crate::dispatcher::{Dispatch, DispatchOptions, Handler, Pool};
use crate::error::Error;
use crate::event::{DispatcherId, Event, Listener, Listeners, Subscription};

pub use self::pool::ClientPool;

mod pool;

// 排队与在途请求达到此数量时，client 报告自己繁忙
const PIPELINING: usize = 1;

/// [`Agent`](crate::Agent) 创建的每个池共用的选项。
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    /// 每个 origin 的最大连接数。
    ///
    /// `Some(1)` 选用单个 [`Client`]，其余选用 [`ClientPool`]。
    /// `None` 表示不限，`Some(0)` 会被拒绝。
    pub connections: Option<usize>,
    /// 在池之间共享的 connector。设置后，下面的 connector 相关选项都被忽略。
    pub connector: Option<Connector>,
    /// TLS 会话缓存容量，默认 100。
    pub max_cached_sessions: Option<usize>,
    /// 目标未指定 server name 时使用的 TLS server name。
    pub server_name: Option<String>,
    /// 通过 Unix domain socket 而不是 TCP 连接。
    pub socket_path: Option<PathBuf>,
    /// TLS 连接使用的 rustls 配置。
    pub tls: Option<ClientConfig>,
}

/// 一组 [`ClientOptions`] 所要求的池的种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolVariant {
    /// 单连接：[`Client`]。
    Single,
    /// 任意数量的连接：[`ClientPool`]。
    Multi,
}

impl ClientOptions {
    /// 根据 `connections` 选择池的种类。
    pub fn variant(&self) -> PoolVariant {
        match self.connections {
            Some(1) => PoolVariant::Single,
            _ => PoolVariant::Multi,
        }
    }

    /// 返回共享的 connector，没有时按这些选项新建一个。
    pub fn connector(&self) -> crate::Result<Connector> {
        if let Some(ref connector) = self.connector {
            return Ok(connector.clone());
        }

        let mut builder = connect::Builder::new();
        if let Some(max) = self.max_cached_sessions {
            builder.max_cached_sessions(max);
        }
        if let Some(ref name) = self.server_name {
            builder.server_name(name.clone());
        }
        if let Some(ref path) = self.socket_path {
            builder.socket_path(path.clone());
        }
        if let Some(ref tls) = self.tls {
            builder.tls_config(tls.clone());
        }
        builder.build()
    }
}

/// 到一个 origin 的单条 HTTP/1.1 连接。
///
/// 连接在第一个请求到来时打开，之后每当请求发现连接已关闭就重新打开。
/// 请求先排队，再由首次 dispatch 时启动的后台任务逐个发送，
/// 因此 dispatch 需要在 tokio 运行时内调用。
///
/// 丢弃 `Client` 时，已排队的请求仍会完成，随后连接关闭。
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    id: DispatcherId,
    origin: String,
    target: Target,
    host: HeaderValue,
    connector: Connector,
    state: Mutex<State>,
    listeners: Listeners,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

struct State {
    queue: VecDeque<Queued>,
    running: usize,
    connected: bool,
    generation: u64,
    started: bool,
    need_drain: bool,
    closed: bool,
    destroyed: bool,
}

struct Queued {
    request: Request<Full<Bytes>>,
    handler: Box<dyn Handler>,
}

struct Connection {
    sender: http1::SendRequest<Full<Bytes>>,
    task: JoinHandle<()>,
}

enum Failure {
    Connect(Arc<Error>),
    Request(Error),
}

// ===== impl Client

impl Client {
    /// 为 `origin` 创建 client，按 `options` 的描述建立连接。
    pub fn new(origin: &str, options: &ClientOptions) -> crate::Result<Client> {
        Client::with_connector(origin, options.connector()?)
    }

    /// 为 `origin` 创建通过 `connector` 建立连接的 client。
    pub fn with_connector(origin: &str, connector: Connector) -> crate::Result<Client> {
        let uri = origin.parse::<Uri>().map_err(Error::new_invalid_url)?;
        let target = Target::from_uri(&uri)?;
        let host = HeaderValue::from_str(&target.host).map_err(Error::new_invalid_url)?;
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        Ok(Client {
            inner: Arc::new(Inner {
                id: DispatcherId::next(),
                origin: origin.to_owned(),
                target,
                host,
                connector,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    running: 0,
                    connected: false,
                    generation: 0,
                    started: false,
                    need_drain: false,
                    closed: false,
                    destroyed: false,
                }),
                listeners: Listeners::new(),
                wake: Notify::new(),
                shutdown,
                done,
            }),
        })
    }

    /// 本 client 在事件 participants 中的标识。
    pub fn id(&self) -> DispatcherId {
        self.inner.id
    }

    /// 本 client 连接的 origin。
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }
}

impl Dispatch for Client {
    /// 把请求排到本 client 的连接上。
    ///
    /// 不读取 `options.origin`：client 只与自己的 origin 通信。
    /// 路径必须是合法的 request target。
    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn Handler>) -> crate::Result<bool> {
        let request = self.inner.request(options)?;

        let mut state = lock(&self.inner.state);
        if state.destroyed {
            return Err(Error::new_destroyed());
        }
        if state.closed {
            return Err(Error::new_closed());
        }
        let spawn = if state.started {
            None
        } else {
            Some(Handle::try_current().map_err(Error::new_runtime)?)
        };

        state.started = true;
        state.queue.push_back(Queued { request, handler });
        let busy = state.queue.len() + state.running >= PIPELINING;
        if busy {
            state.need_drain = true;
        }
        drop(state);

        if let Some(handle) = spawn {
            trace!("starting worker for {}", self.inner.origin);
            handle.spawn(run(self.inner.clone()));
        }
        self.inner.wake.notify_one();
        Ok(!busy)
    }
}

impl Pool for Client {
    fn connected(&self) -> usize {
        lock(&self.inner.state).connected as usize
    }

    fn size(&self) -> usize {
        let state = lock(&self.inner.state);
        state.queue.len() + state.running
    }

    fn pending(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    fn running(&self) -> usize {
        lock(&self.inner.state).running
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    fn close(&self) -> BoxFuture<'static, crate::Result<()>> {
        let started = {
            let mut state = lock(&self.inner.state);
            if state.destroyed {
                Err(Error::new_destroyed())
            } else {
                state.closed = true;
                Ok(state.started)
            }
        };
        self.inner.wake.notify_one();

        let inner = self.inner.clone();
        Box::pin(async move {
            if started? {
                inner.finished().await;
            }
            Ok(())
        })
    }

    fn destroy(&self) -> BoxFuture<'static, crate::Result<()>> {
        let (queued, started) = {
            let mut state = lock(&self.inner.state);
            state.destroyed = true;
            state.closed = true;
            (mem::take(&mut state.queue), state.started)
        };
        for Queued { mut handler, .. } in queued {
            handler.on_error(Error::new_destroyed());
        }
        self.inner.shutdown.send_replace(true);

        let inner = self.inner.clone();
        Box::pin(async move {
            if started {
                inner.finished().await;
            }
            Ok(())
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        lock(&self.inner.state).closed = true;
        self.inner.wake.notify_one();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("connected", &self.connected())
            .field("size", &self.size())
            .finish()
    }
}

// ===== impl Inner

impl Inner {
    fn request(&self, options: DispatchOptions) -> crate::Result<Request<Full<Bytes>>> {
        let uri = options.path.parse::<Uri>().map_err(Error::new_invalid_url)?;
        let mut headers = options.headers;
        if !headers.contains_key(HOST) {
            headers.insert(HOST, self.host.clone());
        }

        let mut request = Request::new(Full::new(options.body.unwrap_or_default()));
        *request.method_mut() = options.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok(request)
    }

    fn next(&self) -> Option<Option<Queued>> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return None;
        }
        match state.queue.pop_front() {
            Some(queued) => {
                state.running += 1;
                Some(Some(queued))
            }
            None if state.closed => None,
            None => Some(None),
        }
    }

    async fn execute(
        self: &Arc<Self>,
        conn: &mut Option<Connection>,
        request: Request<Full<Bytes>>,
        handler: &mut dyn Handler,
    ) -> Result<(), Failure> {
        let conn = match conn.take() {
            Some(open) if !open.sender.is_closed() => conn.insert(open),
            _ => conn.insert(self.connect().await?),
        };

        conn.sender
            .ready()
            .await
            .map_err(|err| Failure::Request(Error::new_http(err)))?;
        let response = conn
            .sender
            .send_request(request)
            .await
            .map_err(|err| Failure::Request(Error::new_http(err)))?;

        let (parts, mut body) = response.into_parts();
        handler.on_headers(parts.status, &parts.headers);

        let mut trailers = None;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|err| Failure::Request(Error::new_http(err)))?;
            match frame.into_data() {
                Ok(chunk) => handler.on_data(chunk),
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers = Some(map);
                    }
                }
            }
        }
        handler.on_complete(trailers);
        Ok(())
    }

    async fn connect(self: &Arc<Self>) -> Result<Connection, Failure> {
        let io = match self.connector.connect(&self.target).await {
            Ok(io) => io,
            Err(err) => {
                debug!("connect to {} failed: {}", self.origin, err);
                return Err(Failure::Connect(Arc::new(err)));
            }
        };
        let (sender, connection) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|err| Failure::Request(Error::new_http(err)))?;

        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.connected = true;
            state.generation
        };

        let inner = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let reason = match connection.await {
                Ok(()) => Error::new_informational("other side closed"),
                Err(err) => Error::new_http(err),
            };
            if let Some(inner) = inner.upgrade() {
                inner.disconnected(generation, reason);
            }
        });

        debug!("connected to {}", self.origin);
        self.listeners.emit(&Event::Connect {
            origin: self.origin.clone(),
            participants: vec![self.id],
        });
        Ok(Connection { sender, task })
    }

    fn disconnected(&self, generation: u64, reason: Error) {
        {
            let mut state = lock(&self.state);
            if state.generation != generation || !state.connected {
                return;
            }
            state.connected = false;
        }
        debug!("disconnected from {}: {}", self.origin, reason);
        self.emit_disconnect(Arc::new(reason));
    }

    fn emit_disconnect(&self, error: Arc<Error>) {
        self.listeners.emit(&Event::Disconnect {
            origin: self.origin.clone(),
            participants: vec![self.id],
            error,
        });
    }

    /// 连接无法建立时，让队列中的每个请求都失败。
    fn fail_queue(&self, err: &Arc<Error>) {
        let queued = {
            let mut state = lock(&self.state);
            mem::take(&mut state.queue)
        };
        for Queued { mut handler, .. } in queued {
            handler.on_error(Error::shared(err));
        }
    }

    fn finish(&self) {
        let drained = {
            let mut state = lock(&self.state);
            state.running -= 1;
            let drained = state.need_drain && state.queue.is_empty() && state.running == 0;
            if drained {
                state.need_drain = false;
            }
            drained
        };
        if drained {
            self.listeners.emit(&Event::Drain {
                origin: self.origin.clone(),
            });
        }
    }

    async fn finished(&self) {
        let mut done = self.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut conn = None;

    while let Some(next) = inner.next() {
        let Queued {
            request,
            mut handler,
        } = match next {
            Some(queued) => queued,
            None => {
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        let result = tokio::select! {
            result = inner.execute(&mut conn, request, &mut *handler) => result,
            _ = shutdown.changed() => Err(Failure::Request(Error::new_destroyed())),
        };

        match result {
            Ok(()) => inner.finish(),
            Err(Failure::Request(err)) => {
                handler.on_error(err);
                inner.finish();
            }
            Err(Failure::Connect(err)) => {
                handler.on_error(Error::shared(&err));
                inner.fail_queue(&err);
                inner.finish();
                inner.emit_disconnect(err);
            }
        }
    }

    let destroyed = lock(&inner.state).destroyed;
    if let Some(Connection { sender, task }) = conn {
        let generation = lock(&inner.state).generation;
        if destroyed {
            inner.disconnected(generation, Error::new_destroyed());
            task.abort();
        } else {
            inner.disconnected(generation, Error::new_closed());
            drop(sender);
            let _ = task.await;
        }
    }
    trace!("worker for {} stopped", inner.origin);
    inner.done.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_follows_connections() {
        let mut options = ClientOptions::default();
        assert_eq!(options.variant(), PoolVariant::Multi);
        options.connections = Some(1);
        assert_eq!(options.variant(), PoolVariant::Single);
        options.connections = Some(4);
        assert_eq!(options.variant(), PoolVariant::Multi);
    }

    #[test]
    fn options_share_a_prebuilt_connector() {
        let connector = Connector::builder().max_cached_sessions(3).build().unwrap();
        let options = ClientOptions {
            connector: Some(connector),
            max_cached_sessions: Some(50),
            ..ClientOptions::default()
        };
        assert_eq!(options.connector().unwrap().max_cached_sessions(), 3);

        let options = ClientOptions {
            max_cached_sessions: Some(50),
            ..ClientOptions::default()
        };
        assert_eq!(options.connector().unwrap().max_cached_sessions(), 50);
    }

    #[test]
    fn new_rejects_bad_origins() {
        let options = ClientOptions::default();
        assert!(Client::new("no-scheme", &options)
            .unwrap_err()
            .is_invalid_argument());
        assert!(Client::new("http://", &options).is_err());
    }

    #[test]
    fn dispatch_outside_runtime() {
        struct Ignore;
        impl Handler for Ignore {
            fn on_error(&mut self, _: Error) {}
        }

        let client = Client::new("http://127.0.0.1:1", &ClientOptions::default()).unwrap();
        let err = client
            .dispatch(DispatchOptions::default(), Box::new(Ignore))
            .unwrap_err();
        assert!(!err.is_invalid_argument());
        assert_eq!(client.size(), 0);
    }

    #[test]
    fn request_fills_in_host() {
        let client = Client::new("http://example.com:8080", &ClientOptions::default()).unwrap();
        let mut options = DispatchOptions::new("http://example.com:8080");
        options.path = "/a?b=c".into();
        let request = client.inner.request(options).unwrap();
        assert_eq!(request.uri(), "/a?b=c");
        assert_eq!(request.headers()[HOST], "example.com:8080");

        let mut options = DispatchOptions::default();
        options.path = "not a path".into();
        assert!(client.inner.request(options).unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn close_rejects_new_work() {
        struct Ignore;
        impl Handler for Ignore {
            fn on_error(&mut self, _: Error) {}
        }

        let client = Client::new("http://127.0.0.1:1", &ClientOptions::default()).unwrap();
        client.close().await.unwrap();
        let err = client
            .dispatch(DispatchOptions::default(), Box::new(Ignore))
            .unwrap_err();
        assert!(err.is_closed());

        client.destroy().await.unwrap();
        assert!(client.close().await.unwrap_err().is_destroyed());
    }
}
