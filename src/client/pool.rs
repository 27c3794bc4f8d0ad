//! 同一 origin 的多连接池
//!
//! [`ClientPool`] 把请求分摊到最多 `connections` 个 [`Client`] 上，
//! 所有 client 共用一个 [`Connector`]，因此也共用一个 TLS 会话缓存。
//!
//! ## 选择 client 的顺序
//!
//! 1. 有空闲的 client（`size() == 0`）时交给它；
//! 2. 否则在未达连接上限时新建一个 client；
//! 3. 已满时排到负载最小的 client 上。
//!
//! client 发出的 connect / disconnect 会在 participants 末尾追加本池的标识后转发；
//! drain 只有在整个池不再繁忙时才由池自己发出。

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{join_all, BoxFuture};
use http::Uri;

use super::{Client, ClientOptions};
use crate::common::lock;
use crate::connect::{Connector, Target};
use crate::dispatcher::{Dispatch, DispatchOptions, Handler, Pool};
use crate::error::Error;
use crate::event::{DispatcherId, Event, Listener, Listeners, Subscription};

/// 同一 origin 的若干 [`Client`]。
///
/// 请求优先交给空闲的 client；没有空闲的 client 且池未满时新增一个，
/// 池满后排到负载最小的 client 上。
pub struct ClientPool {
    inner: Arc<Inner>,
}

struct Inner {
    id: DispatcherId,
    origin: String,
    connector: Connector,
    // `None` 表示不限
    connections: Option<usize>,
    members: Mutex<Members>,
    listeners: Listeners,
}

struct Members {
    clients: Vec<Member>,
    need_drain: bool,
    closed: bool,
    destroyed: bool,
}

struct Member {
    client: Arc<Client>,
    subscription: Subscription,
}

// ===== impl ClientPool

impl ClientPool {
    /// 按 `options` 为 `origin` 创建池。
    pub fn new(origin: &str, options: &ClientOptions) -> crate::Result<ClientPool> {
        ClientPool::with_connector(origin, options.connections, options.connector()?)
    }

    /// 为 `origin` 创建至多 `connections` 个 client 的池；`None` 表示不限数量。
    ///
    /// `Some(0)` 与无法解析的 origin 都会被拒绝。
    pub fn with_connector(
        origin: &str,
        connections: Option<usize>,
        connector: Connector,
    ) -> crate::Result<ClientPool> {
        if connections == Some(0) {
            return Err(Error::new_invalid_connections());
        }
        let uri = origin.parse::<Uri>().map_err(Error::new_invalid_url)?;
        Target::from_uri(&uri)?;

        Ok(ClientPool {
            inner: Arc::new(Inner {
                id: DispatcherId::next(),
                origin: origin.to_owned(),
                connector,
                connections,
                members: Mutex::new(Members {
                    clients: Vec::new(),
                    need_drain: false,
                    closed: false,
                    destroyed: false,
                }),
                listeners: Listeners::new(),
            }),
        })
    }

    /// 本池在事件 participants 中的标识。
    pub fn id(&self) -> DispatcherId {
        self.inner.id
    }

    /// 池中 client 的数量。
    pub fn clients(&self) -> usize {
        lock(&self.inner.members).clients.len()
    }

    /// 复制当前所有 client；返回时成员表已解锁。
    fn snapshot(&self) -> Vec<Arc<Client>> {
        lock(&self.inner.members)
            .clients
            .iter()
            .map(|member| member.client.clone())
            .collect()
    }

    fn sum(&self, f: impl Fn(&Client) -> usize) -> usize {
        self.snapshot().iter().map(|client| f(client)).sum()
    }

    fn teardown(
        &self,
        f: impl Fn(&Client) -> BoxFuture<'static, crate::Result<()>>,
    ) -> BoxFuture<'static, crate::Result<()>> {
        // `Client::destroy` 会同步调用排队请求的处理器
        let futures = self
            .snapshot()
            .iter()
            .map(|client| f(client))
            .collect::<Vec<_>>();

        let inner = self.inner.clone();
        Box::pin(async move {
            let results = join_all(futures).await;
            let members = mem::take(&mut lock(&inner.members).clients);
            for member in members {
                member.subscription.unsubscribe();
            }
            results.into_iter().collect()
        })
    }
}

impl Dispatch for ClientPool {
    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn Handler>) -> crate::Result<bool> {
        let mut members = lock(&self.inner.members);
        if members.destroyed {
            return Err(Error::new_destroyed());
        }
        if members.closed {
            return Err(Error::new_closed());
        }

        let index = self.inner.pick(&mut members)?;
        members.clients[index].client.dispatch(options, handler)?;

        let busy = self.inner.busy(&members);
        if busy {
            members.need_drain = true;
        }
        Ok(!busy)
    }
}

impl Pool for ClientPool {
    fn connected(&self) -> usize {
        self.sum(Client::connected)
    }

    fn size(&self) -> usize {
        self.sum(Client::size)
    }

    fn pending(&self) -> usize {
        self.sum(Client::pending)
    }

    fn running(&self) -> usize {
        self.sum(Client::running)
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    fn close(&self) -> BoxFuture<'static, crate::Result<()>> {
        {
            let mut members = lock(&self.inner.members);
            if members.destroyed {
                return Box::pin(async { Err(Error::new_destroyed()) });
            }
            members.closed = true;
        }
        self.teardown(Client::close)
    }

    fn destroy(&self) -> BoxFuture<'static, crate::Result<()>> {
        {
            let mut members = lock(&self.inner.members);
            members.destroyed = true;
            members.closed = true;
        }
        self.teardown(Client::destroy)
    }
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("connections", &self.inner.connections)
            .field("clients", &self.clients())
            .finish()
    }
}

// ===== impl Inner

impl Inner {
    fn pick(self: &Arc<Self>, members: &mut Members) -> crate::Result<usize> {
        if let Some(idle) = members.clients.iter().position(|m| m.client.size() == 0) {
            return Ok(idle);
        }

        if !self.full(members) || members.clients.is_empty() {
            let client = Arc::new(Client::with_connector(&self.origin, self.connector.clone())?);
            let subscription = client.subscribe(self.relay());
            trace!(
                "pool for {} grew to {} clients",
                self.origin,
                members.clients.len() + 1
            );
            members.clients.push(Member {
                client,
                subscription,
            });
            return Ok(members.clients.len() - 1);
        }

        Ok(members
            .clients
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| m.client.size())
            .map_or(0, |(index, _)| index))
    }

    fn full(&self, members: &Members) -> bool {
        self.connections
            .map_or(false, |max| members.clients.len() >= max)
    }

    fn busy(&self, members: &Members) -> bool {
        self.full(members) && members.clients.iter().all(|m| m.client.size() > 0)
    }

    /// 把 client 的事件转发给本池的监听器。
    fn relay(self: &Arc<Self>) -> Listener {
        let pool: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |event: &Event| {
            let pool = match pool.upgrade() {
                Some(pool) => pool,
                None => return,
            };
            match event {
                Event::Drain { .. } => pool.drained(),
                _ => pool.listeners.emit(&event.relayed(pool.id)),
            }
        })
    }

    fn drained(&self) {
        let drained = {
            let mut members = lock(&self.members);
            let drained = members.need_drain && !self.busy(&members);
            if drained {
                members.need_drain = false;
            }
            drained
        };
        if drained {
            self.listeners.emit(&Event::Drain {
                origin: self.origin.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ignore;

    impl Handler for Ignore {
        fn on_error(&mut self, _: Error) {}
    }

    fn pool(connections: Option<usize>) -> ClientPool {
        ClientPool::with_connector(
            "http://127.0.0.1:1",
            connections,
            Connector::new().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn zero_connections_is_invalid() {
        let err = ClientPool::new(
            "http://a.example",
            &ClientOptions {
                connections: Some(0),
                ..ClientOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn rejects_bad_origin() {
        assert!(ClientPool::new("a.example", &ClientOptions::default())
            .unwrap_err()
            .is_invalid_argument());
    }

    #[tokio::test]
    async fn grows_up_to_the_limit() {
        let pool = pool(Some(2));
        assert!(pool.dispatch(DispatchOptions::default(), Box::new(Ignore)).unwrap());
        assert_eq!(pool.clients(), 1);
        assert!(!pool.dispatch(DispatchOptions::default(), Box::new(Ignore)).unwrap());
        assert_eq!(pool.clients(), 2);
        assert!(!pool.dispatch(DispatchOptions::default(), Box::new(Ignore)).unwrap());
        assert_eq!(pool.clients(), 2);
        assert_eq!(pool.size(), 3);

        pool.destroy().await.unwrap();
        assert_eq!(pool.clients(), 0);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn unbounded_pool_is_never_busy() {
        let pool = pool(None);
        for _ in 0..4 {
            assert!(pool.dispatch(DispatchOptions::default(), Box::new(Ignore)).unwrap());
        }
        assert_eq!(pool.clients(), 4);
        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = pool(None);
        pool.close().await.unwrap();
        let err = pool
            .dispatch(DispatchOptions::default(), Box::new(Ignore))
            .unwrap_err();
        assert!(err.is_closed());

        pool.destroy().await.unwrap();
        assert!(pool.close().await.unwrap_err().is_destroyed());
    }

    #[tokio::test]
    async fn destroy_handlers_may_read_the_pool() {
        struct ReadsPool {
            pool: Weak<ClientPool>,
            seen: Arc<Mutex<Vec<(usize, usize)>>>,
        }

        impl Handler for ReadsPool {
            fn on_error(&mut self, err: Error) {
                assert!(err.is_destroyed());
                if let Some(pool) = self.pool.upgrade() {
                    lock(&self.seen).push((pool.clients(), pool.pending()));
                }
            }
        }

        let pool = Arc::new(pool(Some(2)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let handler = ReadsPool {
                pool: Arc::downgrade(&pool),
                seen: seen.clone(),
            };
            pool.dispatch(DispatchOptions::default(), Box::new(handler))
                .unwrap();
        }

        pool.destroy().await.unwrap();
        let seen = lock(&seen);
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|&(clients, _)| clients == 2));
        assert_eq!(pool.clients(), 0);
    }
}
