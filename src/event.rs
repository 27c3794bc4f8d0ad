//! dispatcher 发出的生命周期事件
//!
//! 池、客户端和 agent 报告同样的三种事件：到某个 origin 的连接建立、连接断开，
//! 以及 dispatcher 不再繁忙（drain）。
//!
//! ## 参与者
//!
//! 事件每经过一个 dispatcher，就把该 dispatcher 的 [`DispatcherId`] 追加到
//! participants 中。监听者据此区分直接来自池的事件和经
//! [`Agent`](crate::Agent) 转发的事件。
//!
//! ## 订阅
//!
//! [`Listeners::subscribe`] 返回一个 [`Subscription`]，只有调用
//! [`Subscription::unsubscribe`] 才会解除订阅。丢弃句柄不会解除，
//! 监听者一直保留到发出者被销毁。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::lock;
use crate::error::Error;

/// 进程内唯一的 dispatcher 标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatcherId(u64);

/// 生命周期事件。
#[derive(Clone, Debug)]
pub enum Event {
    /// 到 `origin` 的连接已建立。
    Connect {
        /// 连接所属的 origin
        origin: String,
        /// 事件经过的所有 dispatcher，最内层在前
        participants: Vec<DispatcherId>,
    },
    /// 到 `origin` 的连接断开，或未能建立。
    Disconnect {
        /// 连接所属的 origin
        origin: String,
        /// 事件经过的所有 dispatcher，最内层在前
        participants: Vec<DispatcherId>,
        /// 连接断开的原因
        error: Arc<Error>,
    },
    /// `origin` 的 dispatcher 不再繁忙。
    Drain {
        /// drain 的 dispatcher 所服务的 origin
        origin: String,
    },
}

/// 发出者每报告一个事件就调用一次的回调。
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// 挂在一个发出者上的监听者集合。
#[derive(Default)]
pub struct Listeners {
    shared: Arc<Mutex<Slots>>,
}

#[derive(Default)]
struct Slots {
    // 下一个订阅的编号，单调递增
    next: u64,
    entries: Vec<(u64, Listener)>,
}

/// 一个已注册监听者的句柄。
#[must_use = "a listener is only detached through `Subscription::unsubscribe`"]
pub struct Subscription {
    slot: Option<(Weak<Mutex<Slots>>, u64)>,
}

// ===== impl DispatcherId =====

impl DispatcherId {
    pub(crate) fn next() -> DispatcherId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DispatcherId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// 返回原始编号。
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

// ===== impl Event =====

impl Event {
    /// 事件涉及的 origin。
    pub fn origin(&self) -> &str {
        match self {
            Event::Connect { origin, .. }
            | Event::Disconnect { origin, .. }
            | Event::Drain { origin } => origin,
        }
    }

    /// 事件经过的 dispatcher；`Drain` 为空。
    pub fn participants(&self) -> &[DispatcherId] {
        match self {
            Event::Connect { participants, .. } | Event::Disconnect { participants, .. } => {
                participants
            }
            Event::Drain { .. } => &[],
        }
    }

    /// 返回经 `by` 转发后的事件副本。
    ///
    /// `Connect` 与 `Disconnect` 的 participants 末尾追加 `by`，`Drain` 原样转发。
    pub(crate) fn relayed(&self, by: DispatcherId) -> Event {
        let mut event = self.clone();
        match event {
            Event::Connect {
                ref mut participants,
                ..
            }
            | Event::Disconnect {
                ref mut participants,
                ..
            } => participants.push(by),
            Event::Drain { .. } => {}
        }
        event
    }
}

// ===== impl Listeners =====

impl Listeners {
    /// 创建空的监听者集合。
    pub fn new() -> Listeners {
        Listeners::default()
    }

    /// 为之后的每个事件注册 `listener`。
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let mut slots = lock(&self.shared);
        let id = slots.next;
        slots.next += 1;
        slots.entries.push((id, listener));
        Subscription {
            slot: Some((Arc::downgrade(&self.shared), id)),
        }
    }

    /// 以 `event` 调用每个已注册的监听者。
    ///
    /// 先对集合做快照，监听者在不持锁的情况下运行，因此可以在被通知时订阅或退订。
    pub fn emit(&self, event: &Event) {
        let listeners = lock(&self.shared)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(event);
        }
    }

    /// 已注册的监听者数量。
    pub fn len(&self) -> usize {
        lock(&self.shared).entries.len()
    }

    /// 没有监听者时返回 true。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

// ===== impl Subscription =====

impl Subscription {
    /// 把监听者从发出者上解除。
    pub fn unsubscribe(mut self) {
        if let Some((shared, id)) = self.slot.take() {
            if let Some(shared) = shared.upgrade() {
                lock(&shared).entries.retain(|(entry, _)| *entry != id);
            }
        }
    }

    /// 发出者仍存活时返回 true。
    pub fn is_attached(&self) -> bool {
        self.slot
            .as_ref()
            .map_or(false, |(shared, _)| shared.strong_count() > 0)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.slot.as_ref().map(|(_, id)| *id);
        f.debug_struct("Subscription").field("id", &id).finish()
    }
}
