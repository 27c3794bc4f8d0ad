//! 源注册表（Origin Registry）
//!
//! [`Agent`] 是大多数调用者需要的调度器：它接受发往任意 origin 的请求，
//! 并把每个请求路由到该 origin 专属的 [`Pool`]，池在首次使用时才创建。
//!
//! ## 在 hyper-agent 中的角色
//!
//! - **惰性建池**：每个 origin 第一次被 dispatch 时调用工厂（[`Factory`]）创建池，
//!   并在转发请求之前订阅它的 connect / disconnect / drain 事件，
//!   因此第一条连接的事件也不会丢失。
//! - **聚合指标**：`connected`、`size`、`pending`、`running` 每次读取时都对
//!   当前所有池重新求和，不做缓存。
//! - **事件转发**：connect 与 disconnect 在 participants 末尾追加本 agent 的
//!   [`DispatcherId`]；drain 原样转发。
//! - **空闲回收**：池在 disconnect 时若已没有连接（`connected == 0`）也没有
//!   排队或在途的请求（`size == 0`），其表项会被删除并显式退订，
//!   面对不断变化的 origin 集合时，agent 不会累积池或监听器。
//!
//! ## 锁与回调
//!
//! 池表只在查找、插入、删除和复制快照时短暂加锁。读指标、`close` 和 `destroy`
//! 都先复制一份池的快照再释放锁，之后才调用各个池；
//! 事件也总是在锁外发出。所以处理器（handler）与监听器可以在回调里
//! 再次读取或调用同一个 agent。
//!
//! ```no_run
//! # fn run() -> hyper_agent::Result<()> {
//! use hyper_agent::{Agent, ClientOptions};
//!
//! let agent = Agent::builder()
//!     .options(ClientOptions {
//!         connections: Some(4),
//!         ..ClientOptions::default()
//!     })
//!     .build();
//! # drop(agent);
//! # Ok(())
//! # }
//! ```

// 标准库：池表、格式化、表项编号与共享状态
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// 等待所有池完成 close / destroy 的扇出组合子
use futures_util::future::{join_all, BoxFuture};

use crate::client::{Client, ClientOptions, ClientPool, PoolVariant};
use crate::common::lock;
use crate::dispatcher::{Dispatch, DispatchOptions, Handler, Pool};
use crate::event::{DispatcherId, Event, Listener, Listeners, Subscription};

/// 为一个 origin 创建池的工厂。
///
/// 传入 origin 与 agent 的共享选项；两次回收之间，每个 origin 至多调用一次。
/// 工厂在池表加锁期间运行，不得 dispatch 到 agent 自身。
pub type Factory =
    Arc<dyn Fn(&str, &ClientOptions) -> crate::Result<Arc<dyn Pool>> + Send + Sync>;

/// 未指定工厂时 agent 使用的默认工厂。
///
/// `options` 只允许一条连接时创建 [`Client`]，否则创建 [`ClientPool`]。
pub fn default_factory(origin: &str, options: &ClientOptions) -> crate::Result<Arc<dyn Pool>> {
    match options.variant() {
        PoolVariant::Single => Ok(Arc::new(Client::new(origin, options)?)),
        PoolVariant::Multi => Ok(Arc::new(ClientPool::new(origin, options)?)),
    }
}

/// 按 origin 分池的调度器。
pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    id: DispatcherId,
    factory: Factory,
    // 原样传给每次工厂调用
    options: ClientOptions,
    pools: Mutex<HashMap<String, Entry>>,
    listeners: Listeners,
    next_entry: AtomicU64,
}

struct Entry {
    // 区分重建后的池与迟到事件所属的旧池
    id: u64,
    pool: Arc<dyn Pool>,
    subscription: Subscription,
}

/// 配置 [`Agent`] 的构建器。
pub struct Builder {
    factory: Option<Factory>,
    options: ClientOptions,
}

// ===== impl Agent

impl Agent {
    /// 使用默认工厂和默认选项创建 agent。
    pub fn new() -> Agent {
        Builder::new().build()
    }

    /// 创建用于配置新 agent 的构建器。
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// 本 agent 在事件 participants 中的标识。
    pub fn id(&self) -> DispatcherId {
        self.inner.id
    }

    /// 当前拥有池的 origin 列表。
    pub fn origins(&self) -> Vec<String> {
        lock(&self.inner.pools).keys().cloned().collect()
    }

    /// 复制当前所有池；返回时池表已解锁。
    fn pools(&self) -> Vec<Arc<dyn Pool>> {
        lock(&self.inner.pools)
            .values()
            .map(|entry| entry.pool.clone())
            .collect()
    }

    fn sum(&self, f: impl Fn(&dyn Pool) -> usize) -> usize {
        self.pools().iter().map(|pool| f(&**pool)).sum()
    }

    fn fan_out(
        &self,
        f: impl Fn(&dyn Pool) -> BoxFuture<'static, crate::Result<()>>,
    ) -> BoxFuture<'static, crate::Result<()>> {
        // 池的 destroy 会同步调用处理器，处理器可能再读本 agent
        let futures = self
            .pools()
            .iter()
            .map(|pool| f(&**pool))
            .collect::<Vec<_>>();
        Box::pin(async move { join_all(futures).await.into_iter().collect() })
    }
}

impl Default for Agent {
    fn default() -> Agent {
        Agent::new()
    }
}

impl Dispatch for Agent {
    /// 把请求路由到 `options.origin` 对应的池。
    ///
    /// origin 缺失或为空时，在查找任何池之前即返回错误；
    /// 否则原样返回池自身的结果。
    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn Handler>) -> crate::Result<bool> {
        let origin = options.checked_origin()?.to_owned();

        let pool = {
            let mut pools = lock(&self.inner.pools);
            match pools.get(&origin) {
                Some(entry) => entry.pool.clone(),
                None => {
                    let pool = (self.inner.factory)(&origin, &self.inner.options)?;
                    let id = self.inner.next_entry.fetch_add(1, Ordering::Relaxed);
                    // 先订阅，再转发第一次 dispatch
                    let subscription = pool.subscribe(self.inner.listener(origin.clone(), id));
                    debug!("created pool for {}", origin);
                    pools.insert(
                        origin,
                        Entry {
                            id,
                            pool: pool.clone(),
                            subscription,
                        },
                    );
                    pool
                }
            }
        };

        pool.dispatch(options, handler)
    }
}

// TODO: pools being closed or destroyed are still counted as connected; track
// them apart so the agent can report `closed` and `destroyed` views.
impl Pool for Agent {
    fn connected(&self) -> usize {
        self.sum(|pool| pool.connected())
    }

    fn size(&self) -> usize {
        self.sum(|pool| pool.size())
    }

    fn pending(&self) -> usize {
        self.sum(|pool| pool.pending())
    }

    fn running(&self) -> usize {
        self.sum(|pool| pool.running())
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    fn close(&self) -> BoxFuture<'static, crate::Result<()>> {
        self.fan_out(|pool| pool.close())
    }

    fn destroy(&self) -> BoxFuture<'static, crate::Result<()>> {
        self.fan_out(|pool| pool.destroy())
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("origins", &self.origins())
            .field("options", &self.inner.options)
            .finish()
    }
}

// ===== impl Inner

impl Inner {
    /// 订阅某个池的监听器：disconnect 时先尝试回收，再转发事件。
    ///
    /// 只持有 agent 的弱引用，池不会让 agent 一直存活。
    fn listener(self: &Arc<Self>, origin: String, entry: u64) -> Listener {
        let agent = Arc::downgrade(self);
        Arc::new(move |event: &Event| {
            let agent = match agent.upgrade() {
                Some(agent) => agent,
                None => return,
            };
            if let Event::Disconnect { .. } = event {
                agent.evict_if_idle(&origin, entry);
            }
            agent.listeners.emit(&event.relayed(agent.id));
        })
    }

    fn evict_if_idle(&self, origin: &str, entry: u64) {
        let evicted = {
            let mut pools = lock(&self.pools);
            let idle = pools.get(origin).map_or(false, |current| {
                current.id == entry && current.pool.connected() == 0 && current.pool.size() == 0
            });
            if idle {
                pools.remove(origin)
            } else {
                None
            }
        };

        // 退订在锁外进行
        if let Some(entry) = evicted {
            entry.subscription.unsubscribe();
            debug!("evicted idle pool for {}", origin);
        }
    }
}

// ===== impl Builder

impl Builder {
    /// 以默认工厂和默认选项创建构建器。
    pub fn new() -> Builder {
        Builder {
            factory: None,
            options: ClientOptions::default(),
        }
    }

    /// 设置为每个 origin 创建池的函数。
    pub fn factory<F>(&mut self, factory: F) -> &mut Builder
    where
        F: Fn(&str, &ClientOptions) -> crate::Result<Arc<dyn Pool>> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// 设置传给每次工厂调用的共享选项。
    pub fn options(&mut self, options: ClientOptions) -> &mut Builder {
        self.options = options;
        self
    }

    /// 构建 agent。
    pub fn build(&self) -> Agent {
        let factory: Factory = match self.factory {
            Some(ref factory) => factory.clone(),
            None => Arc::new(default_factory),
        };
        Agent {
            inner: Arc::new(Inner {
                id: DispatcherId::next(),
                factory,
                options: self.options.clone(),
                pools: Mutex::new(HashMap::new()),
                listeners: Listeners::new(),
                next_entry: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("factory", &self.factory.as_ref().map(|_| "custom"))
            .field("options", &self.options)
            .finish()
    }
}
